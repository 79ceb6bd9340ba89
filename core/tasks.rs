// Copyright 2018-2025 the Deno authors. MIT license.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::thread::ThreadId;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A logical thread that runs posted tasks one at a time, in posting order.
pub trait TaskRunner: Send + Sync {
  fn post_task(&self, task: Task);

  fn runs_tasks_on_current_thread(&self) -> bool;
}

/// Runs `task` inline when already on `runner`, otherwise posts it.
pub fn run_now_or_post_task(runner: &Arc<dyn TaskRunner>, task: Task) {
  if runner.runs_tasks_on_current_thread() {
    task();
  } else {
    runner.post_task(task);
  }
}

/// The task runners an isolate and the engine around it are bound to.
#[derive(Clone, Default)]
pub struct TaskRunners {
  pub label: String,
  pub platform: Option<Arc<dyn TaskRunner>>,
  pub raster: Option<Arc<dyn TaskRunner>>,
  pub ui: Option<Arc<dyn TaskRunner>>,
  pub io: Option<Arc<dyn TaskRunner>>,
}

impl TaskRunners {
  pub fn new(
    label: impl Into<String>,
    platform: Option<Arc<dyn TaskRunner>>,
    raster: Option<Arc<dyn TaskRunner>>,
    ui: Option<Arc<dyn TaskRunner>>,
    io: Option<Arc<dyn TaskRunner>>,
  ) -> Self {
    Self {
      label: label.into(),
      platform,
      raster,
      ui,
      io,
    }
  }

  pub fn is_valid(&self) -> bool {
    self.platform.is_some()
      && self.raster.is_some()
      && self.ui.is_some()
      && self.io.is_some()
  }
}

impl fmt::Debug for TaskRunners {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskRunners")
      .field("label", &self.label)
      .field("valid", &self.is_valid())
      .finish()
  }
}

enum ThreadMessage {
  Run(Task),
  Terminate,
}

/// A dedicated OS thread draining a FIFO queue of tasks.
pub struct ThreadTaskRunner {
  name: String,
  sender: Mutex<mpsc::Sender<ThreadMessage>>,
  thread_id: ThreadId,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTaskRunner {
  pub fn new(name: impl Into<String>) -> std::io::Result<Arc<Self>> {
    let name = name.into();
    let (sender, receiver) = mpsc::channel::<ThreadMessage>();
    let handle = std::thread::Builder::new().name(name.clone()).spawn(
      move || {
        while let Ok(ThreadMessage::Run(task)) = receiver.recv() {
          task();
        }
      },
    )?;
    Ok(Arc::new(Self {
      name,
      sender: Mutex::new(sender),
      thread_id: handle.thread().id(),
      handle: Mutex::new(Some(handle)),
    }))
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Stops the thread after the tasks already posted have run.
  pub fn join(&self) {
    let handle = self.handle.lock().take();
    let Some(handle) = handle else {
      return;
    };
    let _ = self.sender.lock().send(ThreadMessage::Terminate);
    if handle.thread().id() == std::thread::current().id() {
      return;
    }
    if handle.join().is_err() {
      log::error!("Task runner thread {} panicked", self.name);
    }
  }
}

impl TaskRunner for ThreadTaskRunner {
  fn post_task(&self, task: Task) {
    if self.sender.lock().send(ThreadMessage::Run(task)).is_err() {
      log::debug!("Dropped a task posted to terminated thread {}", self.name);
    }
  }

  fn runs_tasks_on_current_thread(&self) -> bool {
    std::thread::current().id() == self.thread_id
  }
}

impl Drop for ThreadTaskRunner {
  fn drop(&mut self) {
    self.join();
  }
}

/// A bounded pool of worker threads shared by everything in the process
/// that needs generic background work.
pub struct ConcurrentMessageLoop {
  runtime: Mutex<Option<tokio::runtime::Runtime>>,
  worker_count: usize,
  worker_ids: Arc<Mutex<Vec<ThreadId>>>,
}

impl ConcurrentMessageLoop {
  pub const MIN_WORKERS: usize = 2;
  pub const MAX_WORKERS: usize = 4;

  /// Worker count derived from the available hardware concurrency.
  pub fn default_worker_count() -> usize {
    (num_cpus::get() / 2).clamp(Self::MIN_WORKERS, Self::MAX_WORKERS)
  }

  pub fn create(worker_count: usize) -> std::io::Result<Arc<Self>> {
    let worker_ids = Arc::new(Mutex::new(Vec::with_capacity(worker_count)));
    let ids = worker_ids.clone();
    let stopped_ids = worker_ids.clone();
    let runtime = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(worker_count)
      .max_blocking_threads(worker_count)
      .thread_name("io.worker")
      .on_thread_start(move || {
        ids.lock().push(std::thread::current().id());
      })
      .on_thread_stop(move || {
        let id = std::thread::current().id();
        stopped_ids.lock().retain(|worker| *worker != id);
      })
      .enable_all()
      .build()?;
    Ok(Arc::new(Self {
      runtime: Mutex::new(Some(runtime)),
      worker_count,
      worker_ids,
    }))
  }

  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  pub fn task_runner(self: &Arc<Self>) -> Arc<ConcurrentTaskRunner> {
    Arc::new(ConcurrentTaskRunner {
      message_loop: Arc::downgrade(self),
    })
  }

  fn post_task(&self, task: Task) -> bool {
    match self.runtime.lock().as_ref() {
      Some(runtime) => {
        // Tasks are synchronous and may block.
        drop(runtime.spawn_blocking(task));
        true
      }
      None => false,
    }
  }

  pub fn runs_tasks_on_current_thread(&self) -> bool {
    self.worker_ids.lock().contains(&std::thread::current().id())
  }

  /// Stops accepting tasks and lets the workers wind down in the background.
  pub fn terminate(&self) {
    if let Some(runtime) = self.runtime.lock().take() {
      runtime.shutdown_background();
    }
  }
}

impl Drop for ConcurrentMessageLoop {
  fn drop(&mut self) {
    self.terminate();
  }
}

/// Posts to a [`ConcurrentMessageLoop`] without keeping it alive.
pub struct ConcurrentTaskRunner {
  message_loop: Weak<ConcurrentMessageLoop>,
}

impl TaskRunner for ConcurrentTaskRunner {
  fn post_task(&self, task: Task) {
    let posted = self
      .message_loop
      .upgrade()
      .is_some_and(|message_loop| message_loop.post_task(task));
    if !posted {
      log::error!(
        "Tried to post to a concurrent message loop that has already been collected."
      );
    }
  }

  fn runs_tasks_on_current_thread(&self) -> bool {
    self
      .message_loop
      .upgrade()
      .is_some_and(|message_loop| message_loop.runs_tasks_on_current_thread())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc::sync_channel;

  #[test]
  fn thread_runner_is_fifo() {
    let runner = ThreadTaskRunner::new("fifo").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
      let seen = seen.clone();
      runner.post_task(Box::new(move || seen.lock().push(i)));
    }
    runner.join();
    assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
  }

  #[test]
  fn thread_runner_knows_its_thread() {
    let runner = ThreadTaskRunner::new("current").unwrap();
    assert!(!runner.runs_tasks_on_current_thread());
    let (tx, rx) = sync_channel(1);
    let r = runner.clone();
    runner.post_task(Box::new(move || {
      tx.send(r.runs_tasks_on_current_thread()).unwrap();
    }));
    assert!(rx.recv().unwrap());
  }

  #[test]
  fn worker_count_is_bounded() {
    let count = ConcurrentMessageLoop::default_worker_count();
    assert!((2..=4).contains(&count));
  }

  #[test]
  fn concurrent_runner_runs_tasks_on_workers() {
    let message_loop = ConcurrentMessageLoop::create(2).unwrap();
    let runner = message_loop.task_runner();
    let (tx, rx) = sync_channel(1);
    let r = runner.clone();
    runner.post_task(Box::new(move || {
      tx.send(r.runs_tasks_on_current_thread()).unwrap();
    }));
    assert!(rx.recv().unwrap());
    assert!(!runner.runs_tasks_on_current_thread());
  }

  #[test]
  fn worker_threads_are_tracked_while_alive() {
    let message_loop = ConcurrentMessageLoop::create(2).unwrap();
    let runner = message_loop.task_runner();
    let (tx, rx) = sync_channel(64);
    for _ in 0..64 {
      let tx = tx.clone();
      let r = runner.clone();
      runner.post_task(Box::new(move || {
        std::thread::sleep(std::time::Duration::from_millis(1));
        tx.send(r.runs_tasks_on_current_thread()).unwrap();
      }));
    }
    for _ in 0..64 {
      assert!(rx.recv().unwrap());
    }
    // Async workers plus at most `worker_count` blocking threads.
    assert!(message_loop.worker_ids.lock().len() <= 4);
  }

  #[test]
  fn posting_after_terminate_is_dropped() {
    let message_loop = ConcurrentMessageLoop::create(2).unwrap();
    let runner = message_loop.task_runner();
    message_loop.terminate();
    let (tx, rx) = sync_channel::<()>(1);
    runner.post_task(Box::new(move || tx.send(()).unwrap()));
    assert!(rx.recv().is_err());
  }
}
