// Copyright 2018-2025 the Deno authors. MIT license.

pub type Closure = Box<dyn FnOnce() + Send + 'static>;

/// Runs its closure when dropped, unless the closure was released first.
///
/// Used to tear down partially constructed state on every early-return path
/// without repeating the cleanup at each `?`.
#[must_use]
#[derive(Default)]
pub struct ScopedCleanupClosure {
  closure: Option<Closure>,
}

impl ScopedCleanupClosure {
  pub fn new(closure: impl FnOnce() + Send + 'static) -> Self {
    Self {
      closure: Some(Box::new(closure)),
    }
  }

  /// Replaces the pending closure, returning the previous one unfired.
  pub fn set_closure(
    &mut self,
    closure: impl FnOnce() + Send + 'static,
  ) -> Option<Closure> {
    self.closure.replace(Box::new(closure))
  }

  /// Disarms the guard. The returned closure is not fired.
  pub fn release(&mut self) -> Option<Closure> {
    self.closure.take()
  }
}

impl Drop for ScopedCleanupClosure {
  fn drop(&mut self) {
    if let Some(closure) = self.closure.take() {
      closure();
    }
  }
}

/// A closure that fires exactly once, when the wrapper is dropped.
pub struct AutoFireClosure {
  closure: Option<Closure>,
}

impl AutoFireClosure {
  pub fn new(closure: impl FnOnce() + Send + 'static) -> Self {
    Self {
      closure: Some(Box::new(closure)),
    }
  }
}

impl Drop for AutoFireClosure {
  fn drop(&mut self) {
    if let Some(closure) = self.closure.take() {
      closure();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, move || {
      c.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn scoped_cleanup_fires_on_drop() {
    let (count, f) = counter();
    {
      let _guard = ScopedCleanupClosure::new(f);
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn released_closure_never_fires() {
    let (count, f) = counter();
    {
      let mut guard = ScopedCleanupClosure::new(f);
      let released = guard.release();
      assert!(released.is_some());
      assert!(guard.release().is_none());
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn replaced_closure_is_handed_back() {
    let (first, f1) = counter();
    let (second, f2) = counter();
    {
      let mut guard = ScopedCleanupClosure::new(f1);
      let previous = guard.set_closure(f2);
      drop(previous);
    }
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn auto_fire_closure_fires_once() {
    let (count, f) = counter();
    let closures = vec![AutoFireClosure::new(f)];
    drop(closures);
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }
}
