// Copyright 2018-2025 the Deno authors. MIT license.

use isolate_host::TaskRunner;
use isolate_host::TaskRunners;
use isolate_host::tasks::ThreadTaskRunner;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

/// The threads an engine runs its isolates on.
pub struct ThreadHost {
  label: String,
  pub platform: Arc<ThreadTaskRunner>,
  pub raster: Arc<ThreadTaskRunner>,
  pub ui: Arc<ThreadTaskRunner>,
  pub io: Arc<ThreadTaskRunner>,
}

impl ThreadHost {
  pub fn new(label: &str) -> std::io::Result<Self> {
    Ok(Self {
      label: label.to_string(),
      platform: ThreadTaskRunner::new(format!("{label}.platform"))?,
      raster: ThreadTaskRunner::new(format!("{label}.raster"))?,
      ui: ThreadTaskRunner::new(format!("{label}.ui"))?,
      io: ThreadTaskRunner::new(format!("{label}.io"))?,
    })
  }

  pub fn task_runners(&self) -> TaskRunners {
    TaskRunners::new(
      self.label.clone(),
      Some(self.platform.clone()),
      Some(self.raster.clone()),
      Some(self.ui.clone()),
      Some(self.io.clone()),
    )
  }
}

impl Drop for ThreadHost {
  fn drop(&mut self) {
    for runner in [&self.ui, &self.io, &self.raster, &self.platform] {
      runner.join();
    }
  }
}

/// Runs `f` on `runner` and waits for its result.
pub fn post_task_sync<R: Send + 'static>(
  runner: &dyn TaskRunner,
  f: impl FnOnce() -> R + Send + 'static,
) -> R {
  let (tx, rx) = mpsc::channel();
  runner.post_task(Box::new(move || {
    let _ = tx.send(f());
  }));
  match rx.recv() {
    Ok(result) => result,
    Err(_) => panic!("Task runner dropped a synchronous task"),
  }
}

/// A one-shot event threads can wait on.
#[derive(Default)]
pub struct Latch {
  signaled: Mutex<bool>,
  condvar: Condvar,
}

impl Latch {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn signal(&self) {
    *self.signaled.lock() = true;
    self.condvar.notify_all();
  }

  pub fn is_signaled(&self) -> bool {
    *self.signaled.lock()
  }

  /// Returns false if the latch was not signaled within `timeout`.
  pub fn wait(&self, timeout: Duration) -> bool {
    let mut signaled = self.signaled.lock();
    if !*signaled {
      let _ = self.condvar.wait_while_for(
        &mut signaled,
        |signaled| !*signaled,
        timeout,
      );
    }
    *signaled
  }
}
