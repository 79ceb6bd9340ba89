// Copyright 2018-2025 the Deno authors. MIT license.

//! The managed runtime hosted by this crate.
//!
//! Programs are kernel manifests whose functions are native closures,
//! resolved per isolate group. The API mirrors what an embedder needs from a
//! runtime: a process-wide initialize/cleanup pair, isolate groups with
//! opaque embedder payloads, a thread-local current isolate, ports and
//! message queues, and lifecycle callbacks into the embedder.

pub mod blob;
mod flags;
mod isolate;
pub mod kernel;
mod message;
mod native;
mod program;
mod spawn;

pub use flags::VmFlags;
pub use isolate::DeferredLoadHandler;
pub use isolate::GroupData;
pub use isolate::IsolateData;
pub use isolate::IsolateFlags;
pub use isolate::IsolateHooks;
pub use isolate::IsolateScope;
pub(crate) use isolate::kill_group_members;
pub use isolate::MessageNotifyCallback;
pub use isolate::VmIsolate;
pub use isolate::create_isolate_group;
pub use isolate::create_isolate_in_group;
pub use isolate::current_isolate;
pub use isolate::current_isolate_data;
pub use isolate::current_isolate_group_data;
pub use isolate::current_thread_owns_isolate;
pub use isolate::enter_isolate;
pub use isolate::exit_isolate;
pub use isolate::isolate_make_runnable;
pub use isolate::set_current_thread_owns_isolate;
pub use isolate::shutdown_isolate;
pub use isolate::sticky_error;
pub use message::ILLEGAL_PORT;
pub use message::PortEx;
pub use message::ServiceMessage;
pub use message::handle_message;
pub use message::handle_service_messages;
pub use message::has_live_ports;
pub use message::has_service_messages;
pub use message::is_paused_on_exit;
pub use message::is_paused_on_start;
pub use message::main_port;
pub use message::post;
pub use message::post_service_message;
pub use message::set_message_notify_callback;
pub use message::set_paused_on_exit;
pub use message::set_paused_on_start;
pub use message::should_pause_on_exit;
pub use message::should_pause_on_start;
pub use native::LoadingUnitCompleter;
pub use native::Microtask;
pub use native::NativeFunction;
pub use native::NativeRegistry;
pub use native::NativeResolver;
pub use native::NativeScope;
pub use native::PortHandler;
pub use program::Library;
pub use program::LibraryTagHandler;
pub use program::deferred_load_complete;
pub use program::deferred_load_complete_error;
pub use program::finalize_loading;
pub use program::invoke;
pub use program::invoke_native;
pub use program::is_kernel;
pub use program::load_library_from_kernel;
pub use program::lookup_function;
pub use program::lookup_library;
pub use program::root_library;
pub use program::set_deferred_load_handler;
pub use program::set_library_tag_handler;
pub use program::set_native_resolver;
pub use program::set_root_library;
pub use program::start_main_isolate;

use crate::snapshot::Snapshot;
use blob::SnapshotKind;
use isolate::IsolateInner;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

/// Script URI reserved for the service isolate.
pub const SERVICE_ISOLATE_NAME: &str = "vm-service";

pub const fn is_precompiled_runtime() -> bool {
  cfg!(feature = "precompiled_runtime")
}

/// A request from the runtime to create a new isolate group.
#[derive(Clone)]
pub struct CreateGroupRequest {
  pub script_uri: String,
  pub main: String,
  pub flags: IsolateFlags,
  /// Payload of the isolate that asked for the group, if any.
  pub parent_data: Option<IsolateData>,
}

/// Lifecycle callbacks the runtime invokes on the embedder.
///
/// These run on whatever thread the runtime happens to be on: the caller of
/// [`cleanup`], a spawned isolate's worker thread, or the thread shutting an
/// isolate down.
pub trait IsolateGroupCallbacks: Send + Sync {
  /// Creates a group for the service isolate or for `Isolate.spawnUri`.
  /// `Ok(None)` declines without an error.
  fn create_group(
    &self,
    request: CreateGroupRequest,
  ) -> Result<Option<VmIsolate>, String>;

  /// Prepares an isolate the runtime spawned into an existing group. The
  /// isolate is current.
  fn initialize_isolate(&self, isolate: &VmIsolate) -> Result<IsolateData, String>;

  /// The isolate is about to shut down. It is still current.
  fn shutdown_isolate(
    &self,
    isolate: &VmIsolate,
    group_data: Option<&GroupData>,
    isolate_data: Option<&IsolateData>,
  );

  /// The isolate is gone; release its payload.
  fn cleanup_isolate(
    &self,
    group_data: Option<GroupData>,
    isolate_data: Option<IsolateData>,
  );

  /// The last isolate of the group is gone; release the group payload.
  fn cleanup_group(&self, group_data: Option<GroupData>);
}

pub struct InitializeParams {
  pub vm_snapshot: Arc<Snapshot>,
  pub callbacks: Arc<dyn IsolateGroupCallbacks>,
}

pub(crate) struct Runtime {
  pub(crate) callbacks: Arc<dyn IsolateGroupCallbacks>,
  pub(crate) isolates: Mutex<HashMap<u64, Weak<IsolateInner>>>,
  pub(crate) ports: Mutex<HashMap<i64, Weak<IsolateInner>>>,
  pub(crate) workers: Mutex<Vec<JoinHandle<()>>>,
  pub(crate) shutting_down: AtomicBool,
  service_isolate: Mutex<Option<VmIsolate>>,
}

static RUNTIME: RwLock<Option<Arc<Runtime>>> = parking_lot::const_rwlock(None);
static FLAGS: Lazy<Mutex<VmFlags>> = Lazy::new(Default::default);

pub(crate) fn runtime() -> Option<Arc<Runtime>> {
  RUNTIME.read().clone()
}

/// Sets the runtime flags. Takes effect for isolates created afterwards.
pub fn set_vm_flags(args: &[String]) -> Result<(), String> {
  let flags = VmFlags::parse(args)?;
  if flags.precompilation && !is_precompiled_runtime() {
    return Err("--precompilation requires a precompiled runtime".to_string());
  }
  *FLAGS.lock() = flags;
  Ok(())
}

pub fn flags() -> VmFlags {
  FLAGS.lock().clone()
}

pub fn initialize(params: InitializeParams) -> Result<(), String> {
  let mut slot = RUNTIME.write();
  if slot.is_some() {
    return Err("VM is already initialized".to_string());
  }
  let (kind, _) =
    blob::decode_snapshot(params.vm_snapshot.data()).map_err(|e| e.message)?;
  if kind != SnapshotKind::Vm {
    return Err("Snapshot is not a VM snapshot".to_string());
  }
  if is_precompiled_runtime() && !params.vm_snapshot.is_valid_for_aot() {
    return Err("Precompiled runtime requires VM snapshot instructions".to_string());
  }
  *slot = Some(Arc::new(Runtime {
    callbacks: params.callbacks,
    isolates: Mutex::new(HashMap::new()),
    ports: Mutex::new(HashMap::new()),
    workers: Mutex::new(Vec::new()),
    shutting_down: AtomicBool::new(false),
    service_isolate: Mutex::new(None),
  }));
  log::debug!("VM initialized");
  Ok(())
}

pub fn is_initialized() -> bool {
  RUNTIME.read().is_some()
}

/// Starts the service isolate through the group-create callback and runs
/// it on a runtime thread. Like every group created through the callback,
/// the isolate must be runnable and not current when returned.
pub fn start_service_isolate() -> Result<Option<VmIsolate>, String> {
  let runtime = runtime().ok_or("VM is not initialized")?;
  let request = CreateGroupRequest {
    script_uri: SERVICE_ISOLATE_NAME.to_string(),
    main: "main".to_string(),
    flags: IsolateFlags {
      load_vmservice_library: true,
      is_system_isolate: true,
      ..Default::default()
    },
    parent_data: None,
  };
  let isolate = runtime.callbacks.create_group(request)?;
  if let Some(isolate) = &isolate {
    spawn::run_service_isolate(isolate.clone()).map_err(|e| e.message)?;
  }
  *runtime.service_isolate.lock() = isolate.clone();
  Ok(isolate)
}

pub fn service_isolate() -> Option<VmIsolate> {
  runtime().and_then(|runtime| runtime.service_isolate.lock().clone())
}

/// Shuts down every remaining isolate and tears the runtime down.
pub fn cleanup() -> Result<(), String> {
  let runtime = runtime().ok_or("VM is not initialized")?;
  runtime.shutting_down.store(true, Ordering::SeqCst);

  let live = |runtime: &Runtime| -> Vec<VmIsolate> {
    runtime
      .isolates
      .lock()
      .values()
      .filter_map(Weak::upgrade)
      .map(VmIsolate)
      .collect()
  };

  // Spawned isolates notice `shutting_down` and shut themselves down.
  for isolate in live(&runtime) {
    isolate.0.wakeup.notify_all();
  }
  let workers = std::mem::take(&mut *runtime.workers.lock());
  for worker in workers {
    if worker.join().is_err() {
      log::error!("An isolate worker thread panicked during VM cleanup");
    }
  }

  if current_isolate().is_some() {
    exit_isolate();
  }

  let service = runtime.service_isolate.lock().take();
  let mut remaining = live(&runtime);
  remaining.sort_by_key(|isolate| Some(isolate) == service.as_ref());
  for isolate in remaining {
    if isolate.is_shut_down() {
      continue;
    }
    if isolate.0.state.lock().entered_on.is_some() {
      log::error!(
        "Isolate {} is still entered on another thread during VM cleanup",
        isolate.name()
      );
      continue;
    }
    enter_isolate(&isolate);
    shutdown_isolate();
  }

  *RUNTIME.write() = None;
  log::debug!("VM cleaned up");
  Ok(())
}
