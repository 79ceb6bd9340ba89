// Copyright 2018-2025 the Deno authors. MIT license.

use super::thread_host::ThreadHost;
use super::thread_host::post_task_sync;
use isolate_host::Isolate;
use isolate_host::IsolateContext;
use isolate_host::IsolateError;
use isolate_host::IsolateLaunchType;
use isolate_host::RootIsolateOptions;
use isolate_host::Settings;
use isolate_host::TaskRunner;
use isolate_host::VmRef;
use isolate_host::infer_from_settings;
use isolate_host::vm::VmIsolate;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::Arc;

// There is one VM per process, so tests that launch one take turns.
static VM_TEST_LOCK: Mutex<()> = parking_lot::const_mutex(());

pub fn vm_test_guard() -> MutexGuard<'static, ()> {
  let _ = env_logger::builder().is_test(true).try_init();
  VM_TEST_LOCK.lock()
}

/// Shuts its root isolate down on the UI thread when dropped.
pub struct AutoIsolateShutdown {
  isolate: Arc<Isolate>,
  ui: Arc<dyn TaskRunner>,
}

impl AutoIsolateShutdown {
  pub fn isolate(&self) -> &Arc<Isolate> {
    &self.isolate
  }

  pub fn vm_isolate(&self) -> VmIsolate {
    self
      .isolate
      .vm_isolate()
      .cloned()
      .expect("root isolate has a runtime isolate")
  }

  /// Runs `f` on the isolate's UI thread.
  pub fn run_on_ui<R: Send + 'static>(
    &self,
    f: impl FnOnce(&Arc<Isolate>) -> R + Send + 'static,
  ) -> R {
    let isolate = self.isolate.clone();
    post_task_sync(&*self.ui, move || f(&isolate))
  }

  /// Runs `f` on the UI thread with the isolate current.
  pub fn run_in_isolate_scope<R: Send + 'static>(
    &self,
    f: impl FnOnce() -> R + Send + 'static,
  ) -> R {
    self.run_on_ui(move |isolate| {
      let _scope = isolate.scope().expect("isolate is alive");
      f()
    })
  }

  /// Waits for the UI thread to finish everything posted to it so far.
  pub fn flush_ui(&self) {
    post_task_sync(&*self.ui, || {});
  }
}

impl Drop for AutoIsolateShutdown {
  fn drop(&mut self) {
    let isolate = self.isolate.clone();
    post_task_sync(&*self.ui, move || {
      if let Err(error) = isolate.shutdown() {
        log::debug!("Root isolate was already gone: {error}");
      }
    });
  }
}

/// Creates and runs a root isolate on `host`'s UI thread, the way an engine
/// does. `configure` can adjust the options before creation. Without a
/// configuration of its own, one is inferred from `settings` for a new group,
/// or for the spawning isolate's group when there is one.
pub fn run_root_isolate(
  vm: &VmRef,
  host: &ThreadHost,
  settings: &Settings,
  configure: impl FnOnce(&mut RootIsolateOptions),
) -> Result<AutoIsolateShutdown, IsolateError> {
  let mut options = RootIsolateOptions {
    settings: settings.clone(),
    isolate_snapshot: Some(vm.vm_data().isolate_snapshot().clone()),
    context: IsolateContext {
      task_runners: host.task_runners(),
      advisory_script_uri: settings.advisory_script_uri.clone(),
      advisory_script_entrypoint: settings.advisory_script_entrypoint.clone(),
    },
    ..Default::default()
  };
  configure(&mut options);
  if options.isolate_configuration.is_none() {
    let launch_type = match options.spawning_isolate {
      Some(_) => IsolateLaunchType::ExistingGroup,
      None => IsolateLaunchType::NewGroup,
    };
    let io: Arc<dyn TaskRunner> = host.io.clone();
    options.isolate_configuration =
      infer_from_settings(&options.settings, Some(io), launch_type);
  }

  let ui: Arc<dyn TaskRunner> = host.ui.clone();
  let isolate = post_task_sync(&*ui, move || {
    Isolate::create_running_root_isolate(options).map(|weak| weak.upgrade())
  })?;
  let Some(isolate) = isolate else {
    return Err(IsolateError::Create(
      "Root isolate went away right after it started".to_string(),
    ));
  };
  Ok(AutoIsolateShutdown { isolate, ui })
}

