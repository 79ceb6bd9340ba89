// Copyright 2018-2025 the Deno authors. MIT license.

use super::vm_data::VmData;
use crate::error::VmCreateError;
use crate::isolate::EmbedderCallbacks;
use crate::name_server::IsolateNameServer;
use crate::service_protocol::ServiceProtocol;
use crate::settings::Settings;
use crate::snapshot::Snapshot;
use crate::tasks::ConcurrentMessageLoop;
use crate::tasks::TaskRunner;
use crate::vm;
use crate::vm::InitializeParams;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

static VM_LAUNCH_COUNT: AtomicUsize = AtomicUsize::new(0);

const STARTUP_TIMELINE_STREAMS: &str = "Compiler,Dart,Debugger,Embedder,GC,Isolate,VM";
const SYSTRACE_TIMELINE_STREAMS: &str = "Compiler,Dart,Debugger,Embedder,GC,Isolate,VM,API";
const FILE_TIMELINE_STREAMS: &str = "Dart,Embedder,GC";

/// The runtime flags a VM launched with `settings` is configured with.
/// Settings' own `vm_flags` come last and win.
pub fn vm_flags_for_settings(settings: &Settings) -> Vec<String> {
  let mut args: Vec<String> = vec![
    // Flags the runtime does not know about must not abort the launch.
    "--ignore-unrecognized-flags".into(),
    "--enable_mirrors=false".into(),
    "--background_compilation".into(),
  ];

  if vm::is_precompiled_runtime() {
    args.push("--precompilation".into());
  }

  let enable_asserts = !settings.disable_vm_asserts && !vm::is_precompiled_runtime();
  if enable_asserts {
    args.push("--enable_asserts".into());
  }

  if settings.enable_serial_gc {
    args.extend(
      [
        "--concurrent_mark=false",
        "--concurrent_sweep=false",
        "--compactor_tasks=1",
        "--scavenger_tasks=0",
        "--marker_tasks=0",
      ]
      .map(String::from),
    );
  }

  if settings.start_paused {
    args.push("--pause_isolates_on_start".into());
  }

  if settings.endless_trace_buffer || settings.trace_startup {
    args.push("--timeline_recorder=endless".into());
  }

  if settings.trace_systrace {
    args.push("--timeline_recorder=systrace".into());
    args.push(format!("--timeline_streams={SYSTRACE_TIMELINE_STREAMS}"));
  }

  if !settings.trace_to_file.is_empty() {
    args.push(format!("--timeline_recorder=file:{}", settings.trace_to_file));
    args.push(format!("--timeline_streams={FILE_TIMELINE_STREAMS}"));
  }

  if settings.trace_startup {
    args.push(format!("--timeline_streams={STARTUP_TIMELINE_STREAMS}"));
  }

  if settings.enable_vm_profiling {
    args.extend(
      ["--profiler", "--profile_vm", "--profile_period=1000"].map(String::from),
    );
  } else {
    args.push("--no-profiler".into());
  }

  if settings.old_gen_heap_size > 0 {
    args.push(format!("--old_gen_heap_size={}", settings.old_gen_heap_size));
  }

  args.extend(settings.vm_flags.iter().cloned());
  args
}

/// The process-wide runtime and the services that live exactly as long as
/// it does. Only obtainable through [`VmRef`].
pub struct Vm {
  vm_data: Arc<VmData>,
  concurrent_message_loop: Arc<ConcurrentMessageLoop>,
  isolate_name_server: Arc<IsolateNameServer>,
  service_protocol: Arc<ServiceProtocol>,
}

impl Vm {
  /// How many VMs this process has launched so far.
  pub fn vm_launch_count() -> usize {
    VM_LAUNCH_COUNT.load(Ordering::SeqCst)
  }

  pub fn is_running_precompiled_code() -> bool {
    vm::is_precompiled_runtime()
  }

  fn create(
    settings: Settings,
    vm_snapshot: Option<Arc<Snapshot>>,
    isolate_snapshot: Option<Arc<Snapshot>>,
    isolate_name_server: Arc<IsolateNameServer>,
  ) -> Result<Arc<Vm>, VmCreateError> {
    let vm_data = VmData::create(settings, vm_snapshot, isolate_snapshot)?;

    let concurrent_message_loop =
      ConcurrentMessageLoop::create(ConcurrentMessageLoop::default_worker_count())
        .map_err(|error| {
          VmCreateError::Initialize(format!(
            "Could not start the concurrent message loop: {error}"
          ))
        })?;

    let args = vm_flags_for_settings(vm_data.settings());
    if let Err(error) = vm::set_vm_flags(&args) {
      log::error!("Could not set VM flags: {error}");
      return Err(VmCreateError::Flags(error));
    }

    if let Err(error) = vm::initialize(InitializeParams {
      vm_snapshot: vm_data.vm_snapshot().clone(),
      callbacks: Arc::new(EmbedderCallbacks),
    }) {
      log::error!("Error while initializing the VM: {error}");
      return Err(VmCreateError::Initialize(error));
    }

    let launch = VM_LAUNCH_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
    log::debug!(
      "VM launch {launch} with {} workers and flags {args:?}",
      concurrent_message_loop.worker_count()
    );

    Ok(Arc::new(Vm {
      vm_data,
      concurrent_message_loop,
      isolate_name_server,
      service_protocol: Arc::new(ServiceProtocol::new()),
    }))
  }

  pub fn settings(&self) -> &Settings {
    self.vm_data.settings()
  }

  pub fn vm_data(&self) -> &Arc<VmData> {
    &self.vm_data
  }

  pub fn isolate_name_server(&self) -> &Arc<IsolateNameServer> {
    &self.isolate_name_server
  }

  pub fn service_protocol(&self) -> &Arc<ServiceProtocol> {
    &self.service_protocol
  }

  pub fn concurrent_message_loop(&self) -> &Arc<ConcurrentMessageLoop> {
    &self.concurrent_message_loop
  }

  /// A runner for background work that must not block any isolate.
  pub fn concurrent_worker_task_runner(&self) -> Arc<dyn TaskRunner> {
    self.concurrent_message_loop.task_runner()
  }
}

impl Drop for Vm {
  fn drop(&mut self) {
    // Pending background work is abandoned.
    self.concurrent_message_loop.terminate();
    if vm::current_isolate().is_some() {
      vm::exit_isolate();
    }
    if let Err(error) = vm::cleanup() {
      log::error!("Could not cleanly shut down the VM: {error}");
    }
    log::debug!("VM shut down");
  }
}

struct VmSlot {
  vm: Weak<Vm>,
  // Keeps the VM alive for the rest of the process in leak mode.
  leaked: Option<Arc<Vm>>,
}

#[derive(Default)]
struct VmDependents {
  vm_data: Weak<VmData>,
  service_protocol: Weak<ServiceProtocol>,
  isolate_name_server: Weak<IsolateNameServer>,
}

// Serializes VM creation and destruction.
static VM_LIFECYCLE: Mutex<VmSlot> = parking_lot::const_mutex(VmSlot {
  vm: Weak::new(),
  leaked: None,
});

// Lets isolate callbacks reach VM-owned state without touching the
// lifecycle lock, which is held while the VM shuts isolates down.
static VM_DEPENDENTS: Mutex<VmDependents> =
  parking_lot::const_mutex(VmDependents {
    vm_data: Weak::new(),
    service_protocol: Weak::new(),
    isolate_name_server: Weak::new(),
  });

/// A strong reference to the process-wide [`Vm`].
///
/// At most one VM runs at a time. It is created by the first
/// [`VmRef::create`] and torn down when the last reference is dropped,
/// unless the settings asked for it to be leaked.
///
/// ```ignore
/// let vm = VmRef::create(settings, None, None)?;
/// let runner = vm.concurrent_worker_task_runner();
/// ```
#[must_use]
pub struct VmRef {
  vm: Option<Arc<Vm>>,
}

impl VmRef {
  /// Returns the running VM, or launches one configured with `settings`.
  ///
  /// When a VM is already running, its configuration stays as it is and
  /// the arguments are discarded.
  pub fn create(
    settings: Settings,
    vm_snapshot: Option<Arc<Snapshot>>,
    isolate_snapshot: Option<Arc<Snapshot>>,
  ) -> Result<VmRef, VmCreateError> {
    let mut slot = VM_LIFECYCLE.lock();

    if !settings.leak_vm {
      assert!(
        slot.leaked.is_none(),
        "Launch settings missing the leak VM flag in a process that already leaked a VM"
      );
    }

    if let Some(vm) = slot.vm.upgrade() {
      log::warn!(
        "Attempted to create a VM in a process where one was already running. Ignoring arguments for current VM create call and reusing the old VM."
      );
      return Ok(VmRef { vm: Some(vm) });
    }

    let vm = {
      let mut dependents = VM_DEPENDENTS.lock();
      *dependents = VmDependents::default();

      let vm = Vm::create(
        settings,
        vm_snapshot,
        isolate_snapshot,
        Arc::new(IsolateNameServer::new()),
      )
      .inspect_err(|error| log::error!("Could not create VM instance: {error}"))?;

      dependents.vm_data = Arc::downgrade(vm.vm_data());
      dependents.service_protocol = Arc::downgrade(vm.service_protocol());
      dependents.isolate_name_server = Arc::downgrade(vm.isolate_name_server());
      vm
    };

    slot.vm = Arc::downgrade(&vm);
    if vm.settings().leak_vm {
      slot.leaked = Some(vm.clone());
    }

    if vm.settings().enable_vm_service {
      match vm::start_service_isolate() {
        Ok(Some(_)) => {}
        Ok(None) => log::debug!("The service isolate was not started"),
        Err(error) => log::error!("Could not start the service isolate: {error}"),
      }
    }

    Ok(VmRef { vm: Some(vm) })
  }

  pub fn is_instance_running() -> bool {
    VM_LIFECYCLE.lock().vm.strong_count() > 0
  }

  pub fn get_vm_data() -> Option<Arc<VmData>> {
    VM_DEPENDENTS.lock().vm_data.upgrade()
  }

  pub fn get_service_protocol() -> Option<Arc<ServiceProtocol>> {
    VM_DEPENDENTS.lock().service_protocol.upgrade()
  }

  pub fn get_isolate_name_server() -> Option<Arc<IsolateNameServer>> {
    VM_DEPENDENTS.lock().isolate_name_server.upgrade()
  }

  /// Runs `f` with the running VM.
  ///
  /// # Panics
  ///
  /// If no VM is running.
  pub fn with_running_vm<R>(f: impl FnOnce(&Vm) -> R) -> R {
    let vm = VM_LIFECYCLE.lock().vm.upgrade();
    let Some(vm) = vm else {
      panic!("Caller assumed VM would be running when it wasn't");
    };
    let vm_ref = VmRef { vm: Some(vm) };
    f(&vm_ref)
  }
}

impl Deref for VmRef {
  type Target = Vm;

  fn deref(&self) -> &Vm {
    match &self.vm {
      Some(vm) => vm,
      None => unreachable!("VmRef is only empty while it is dropped"),
    }
  }
}

impl Drop for VmRef {
  fn drop(&mut self) {
    // The last reference tears the VM down under the lifecycle lock.
    let _slot = VM_LIFECYCLE.lock();
    self.vm.take();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn default_flags() {
    let flags = vm_flags_for_settings(&Settings::default());
    let mut expected = vec![
      "--ignore-unrecognized-flags",
      "--enable_mirrors=false",
      "--background_compilation",
    ];
    if vm::is_precompiled_runtime() {
      expected.push("--precompilation");
    } else {
      expected.push("--enable_asserts");
    }
    expected.push("--no-profiler");
    assert_eq!(flags, expected);
  }

  #[test]
  fn flags_follow_settings() {
    let settings = Settings {
      disable_vm_asserts: true,
      enable_serial_gc: true,
      start_paused: true,
      trace_startup: true,
      enable_vm_profiling: true,
      old_gen_heap_size: 512,
      vm_flags: vec!["--verify_entry_points".to_string()],
      ..Default::default()
    };
    let flags = vm_flags_for_settings(&settings);
    for flag in [
      "--concurrent_mark=false",
      "--scavenger_tasks=0",
      "--pause_isolates_on_start",
      "--timeline_recorder=endless",
      "--profiler",
      "--profile_period=1000",
      "--old_gen_heap_size=512",
    ] {
      assert!(flags.iter().any(|f| f == flag), "missing {flag}");
    }
    assert!(!flags.iter().any(|f| f == "--enable_asserts"));
    assert_eq!(flags.last().map(String::as_str), Some("--verify_entry_points"));
    assert!(vm::VmFlags::parse(&flags).is_ok());
  }

  #[test]
  fn trace_to_file_records_to_path() {
    let settings = Settings {
      trace_to_file: "/tmp/trace.json".to_string(),
      ..Default::default()
    };
    let flags = vm_flags_for_settings(&settings);
    assert!(flags.contains(&"--timeline_recorder=file:/tmp/trace.json".to_string()));
    assert!(flags.contains(&format!("--timeline_streams={FILE_TIMELINE_STREAMS}")));
  }
}
