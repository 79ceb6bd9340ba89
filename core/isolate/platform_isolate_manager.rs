// Copyright 2018-2025 the Deno authors. MIT license.

use crate::vm;
use crate::vm::IsolateScope;
use crate::vm::VmIsolate;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashSet;

#[derive(Default)]
struct ManagerState {
  is_shutdown: bool,
  platform_isolates: HashSet<VmIsolate>,
}

/// Tracks the platform isolates of a root isolate so they can all be shut
/// down together, on the platform thread, when the engine goes away.
///
/// The lock is re-entrant: shutting an isolate down from
/// [`shutdown_platform_isolates`](Self::shutdown_platform_isolates) calls
/// back into [`remove_platform_isolate`](Self::remove_platform_isolate) on
/// the same thread.
#[derive(Default)]
pub struct PlatformIsolateManager {
  state: ReentrantMutex<RefCell<ManagerState>>,
}

impl PlatformIsolateManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Whether [`shutdown_platform_isolates`](Self::shutdown_platform_isolates)
  /// has run. Meant for the platform thread.
  pub fn has_shutdown(&self) -> bool {
    self.state.lock().borrow().is_shutdown
  }

  /// Same as [`has_shutdown`](Self::has_shutdown) but callable from any
  /// thread. A shutdown racing with the call may not be observed yet, so
  /// only use this for best-effort early outs.
  pub fn has_shutdown_maybe_false_negative(&self) -> bool {
    self.state.lock().borrow().is_shutdown
  }

  /// Returns false without registering once the manager has shut down.
  pub fn register_platform_isolate(&self, isolate: &VmIsolate) -> bool {
    let guard = self.state.lock();
    let mut state = guard.borrow_mut();
    if state.is_shutdown {
      // Shutdown may have happened while we were waiting for the lock.
      return false;
    }
    let inserted = state.platform_isolates.insert(isolate.clone());
    debug_assert!(inserted, "Platform isolate {isolate:?} registered twice");
    true
  }

  pub fn remove_platform_isolate(&self, isolate: &VmIsolate) {
    let guard = self.state.lock();
    let mut state = guard.borrow_mut();
    if state.is_shutdown {
      // Removal during shutdown_platform_isolates; the set is already empty.
      debug_assert!(state.platform_isolates.is_empty());
      return;
    }
    let removed = state.platform_isolates.remove(isolate);
    debug_assert!(removed, "Platform isolate {isolate:?} was not registered");
  }

  /// Shuts down every registered platform isolate, one at a time on the
  /// calling thread. No registration succeeds afterwards.
  pub fn shutdown_platform_isolates(&self) {
    let guard = self.state.lock();
    let platform_isolates = {
      let mut state = guard.borrow_mut();
      state.is_shutdown = true;
      std::mem::take(&mut state.platform_isolates)
    };
    for isolate in platform_isolates {
      if isolate.is_shut_down() {
        continue;
      }
      let _scope = IsolateScope::new(&isolate);
      vm::shutdown_isolate();
    }
    drop(guard);
  }

  pub fn is_registered_for_testing_only(&self, isolate: &VmIsolate) -> bool {
    self.state.lock().borrow().platform_isolates.contains(isolate)
  }
}
