// Copyright 2018-2025 the Deno authors. MIT license.

use super::Runtime;
use super::SERVICE_ISOLATE_NAME;
use super::blob;
use super::blob::SnapshotKind;
use super::is_precompiled_runtime;
use super::kernel::KernelProgram;
use super::message::Message;
use super::message::PortEx;
use super::message::ServiceMessage;
use super::native::LoadingUnitCompleter;
use super::native::Microtask;
use super::native::PortHandler;
use super::program::Program;
use super::runtime;
use crate::error::VmError;
use crate::snapshot::Snapshot;
use once_cell::sync::OnceCell;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread::ThreadId;

/// Embedder payload attached to an isolate.
pub type IsolateData = Arc<dyn Any + Send + Sync>;
/// Embedder payload attached to an isolate group.
pub type GroupData = Arc<dyn Any + Send + Sync>;

/// Told that a message arrived for an isolate. May run on any thread.
pub type MessageNotifyCallback = Arc<dyn Fn(&VmIsolate) + Send + Sync>;

/// Asked to fetch a deferred loading unit.
pub type DeferredLoadHandler =
  Arc<dyn Fn(i64) -> Result<(), VmError> + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsolateFlags {
  pub is_dont_need_safe: bool,
  pub load_vmservice_library: bool,
  pub is_system_isolate: bool,
}

/// Per-isolate replacements for the process-wide shutdown and cleanup
/// callbacks.
#[derive(Clone, Default)]
pub struct IsolateHooks {
  pub shutdown: Option<Arc<dyn Fn(&VmIsolate) + Send + Sync>>,
  pub cleanup: Option<Arc<dyn Fn(Option<IsolateData>) + Send + Sync>>,
}

pub(crate) struct GroupInner {
  pub(crate) id: u64,
  pub(crate) script_uri: String,
  pub(crate) is_service: bool,
  pub(crate) data: Mutex<Option<GroupData>>,
  pub(crate) program: Mutex<Program>,
  pub(crate) members: Mutex<Vec<Weak<IsolateInner>>>,
  root_isolate_id: OnceCell<u64>,
}

#[derive(Default)]
pub(crate) struct IsolateState {
  pub(crate) entered_on: Option<ThreadId>,
  pub(crate) owner_thread: Option<ThreadId>,
  pub(crate) runnable: bool,
  pub(crate) shutting_down: bool,
  pub(crate) shut_down: bool,
  pub(crate) vm_managed: bool,
  pub(crate) messages: VecDeque<Message>,
  pub(crate) service_messages: VecDeque<ServiceMessage>,
  pub(crate) microtasks: VecDeque<Microtask>,
  pub(crate) ports: HashMap<i64, PortHandler>,
  pub(crate) notify: Option<MessageNotifyCallback>,
  pub(crate) should_pause_on_start: bool,
  pub(crate) should_pause_on_exit: bool,
  pub(crate) paused_on_start: bool,
  pub(crate) paused_on_exit: bool,
  pub(crate) sticky_error: Option<VmError>,
  pub(crate) deferred_load_handler: Option<DeferredLoadHandler>,
  pub(crate) pending_loading_units: HashMap<i64, LoadingUnitCompleter>,
  pub(crate) failed_loading_units: HashSet<i64>,
}

pub(crate) struct IsolateInner {
  pub(crate) id: u64,
  pub(crate) name: String,
  pub(crate) group: Arc<GroupInner>,
  pub(crate) main_port: PortEx,
  pub(crate) flags: IsolateFlags,
  hooks: IsolateHooks,
  pub(crate) data: Mutex<Option<IsolateData>>,
  pub(crate) state: Mutex<IsolateState>,
  /// Signalled when work arrives for a runtime-driven isolate.
  pub(crate) wakeup: Condvar,
}

/// A handle to a runtime isolate. Stays valid after the isolate shut down.
#[derive(Clone)]
pub struct VmIsolate(pub(crate) Arc<IsolateInner>);

impl VmIsolate {
  pub fn id(&self) -> u64 {
    self.0.id
  }

  pub fn name(&self) -> &str {
    &self.0.name
  }

  pub fn script_uri(&self) -> &str {
    &self.0.group.script_uri
  }

  pub fn group_id(&self) -> u64 {
    self.0.group.id
  }

  pub fn main_port(&self) -> PortEx {
    self.0.main_port
  }

  pub fn flags(&self) -> IsolateFlags {
    self.0.flags
  }

  pub fn data(&self) -> Option<IsolateData> {
    self.0.data.lock().clone()
  }

  pub fn group_data(&self) -> Option<GroupData> {
    self.0.group.data.lock().clone()
  }

  pub fn is_shut_down(&self) -> bool {
    self.0.state.lock().shut_down
  }

  /// Whether this is the isolate its group was created with.
  pub fn is_group_root(&self) -> bool {
    self.0.group.root_isolate_id.get() == Some(&self.0.id)
  }

  pub fn is_service_isolate(&self) -> bool {
    self.0.group.is_service
  }

  pub fn is_runnable(&self) -> bool {
    self.0.state.lock().runnable
  }

  /// Whether the runtime drives this isolate's message loop.
  pub fn is_vm_managed(&self) -> bool {
    self.0.state.lock().vm_managed
  }

  /// Whether both handles name an isolate of the same group.
  pub fn same_group(&self, other: &VmIsolate) -> bool {
    Arc::ptr_eq(&self.0.group, &other.0.group)
  }

  pub(crate) fn set_data(&self, data: Option<IsolateData>) {
    *self.0.data.lock() = data;
  }
}

impl PartialEq for VmIsolate {
  fn eq(&self, other: &Self) -> bool {
    self.0.id == other.0.id
  }
}

impl Eq for VmIsolate {}

impl Hash for VmIsolate {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.0.id.hash(state);
  }
}

impl fmt::Debug for VmIsolate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("VmIsolate")
      .field("id", &self.0.id)
      .field("name", &self.0.name)
      .field("group", &self.0.group.id)
      .finish()
  }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
  static CURRENT: RefCell<Option<VmIsolate>> = const { RefCell::new(None) };
}

fn new_isolate(
  runtime: &Runtime,
  group: Arc<GroupInner>,
  name: &str,
  flags: IsolateFlags,
  hooks: IsolateHooks,
  data: Option<IsolateData>,
) -> VmIsolate {
  let vm_flags = super::flags();
  let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
  let port_id = super::message::new_port_id();
  let main_port = PortEx {
    port_id,
    origin_id: port_id,
  };
  let state = IsolateState {
    should_pause_on_start: vm_flags.pause_isolates_on_start && !group.is_service,
    should_pause_on_exit: vm_flags.pause_isolates_on_exit && !group.is_service,
    ..Default::default()
  };
  let isolate = VmIsolate(Arc::new(IsolateInner {
    id,
    name: name.to_string(),
    group: group.clone(),
    main_port,
    flags,
    hooks,
    data: Mutex::new(data),
    state: Mutex::new(state),
    wakeup: Condvar::new(),
  }));
  let _ = group.root_isolate_id.set(id);
  group.members.lock().push(Arc::downgrade(&isolate.0));
  runtime
    .isolates
    .lock()
    .insert(id, Arc::downgrade(&isolate.0));
  runtime
    .ports
    .lock()
    .insert(main_port.port_id, Arc::downgrade(&isolate.0));
  isolate
}

/// Creates a group and its first isolate from an isolate snapshot. The new
/// isolate is current on return.
pub fn create_isolate_group(
  script_uri: &str,
  name: &str,
  snapshot: &Snapshot,
  flags: IsolateFlags,
  group_data: GroupData,
  isolate_data: IsolateData,
) -> Result<VmIsolate, String> {
  let runtime = runtime().ok_or("VM is not initialized")?;
  if current_isolate().is_some() {
    return Err(
      "Cannot create an isolate group while an isolate is current".to_string(),
    );
  }
  let (kind, payload) =
    blob::decode_snapshot(snapshot.data()).map_err(|e| e.message)?;
  if kind != SnapshotKind::Isolate {
    return Err("Snapshot is not an isolate snapshot".to_string());
  }

  let mut program = Program::default();
  if is_precompiled_runtime() {
    if !snapshot.is_valid_for_aot() {
      return Err("Precompiled snapshot has no instructions".to_string());
    }
    let kernel = KernelProgram::from_manifest(payload).map_err(|e| e.message)?;
    let root = program.add(kernel).map_err(|e| e.message)?;
    program.set_root_library(Some(root));
  }

  let group = Arc::new(GroupInner {
    id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
    script_uri: script_uri.to_string(),
    is_service: flags.load_vmservice_library
      && script_uri == SERVICE_ISOLATE_NAME,
    data: Mutex::new(Some(group_data)),
    program: Mutex::new(program),
    members: Mutex::new(Vec::new()),
    root_isolate_id: OnceCell::new(),
  });
  let isolate = new_isolate(
    &runtime,
    group,
    name,
    flags,
    IsolateHooks::default(),
    Some(isolate_data),
  );
  enter_isolate(&isolate);
  log::debug!("Created isolate group {script_uri} ({})", isolate.name());
  Ok(isolate)
}

/// Creates an isolate in the group of `member`. The new isolate is current
/// on return, so no isolate may be current on the calling thread.
pub fn create_isolate_in_group(
  member: &VmIsolate,
  name: &str,
  hooks: IsolateHooks,
  isolate_data: Option<IsolateData>,
) -> Result<VmIsolate, String> {
  if current_isolate().is_some() {
    return Err(
      "Cannot create an isolate while another isolate is current".to_string(),
    );
  }
  let isolate = new_isolate_in_group(member, name, hooks, isolate_data)?;
  enter_isolate(&isolate);
  Ok(isolate)
}

pub(crate) fn new_isolate_in_group(
  member: &VmIsolate,
  name: &str,
  hooks: IsolateHooks,
  isolate_data: Option<IsolateData>,
) -> Result<VmIsolate, String> {
  let runtime = runtime().ok_or("VM is not initialized")?;
  if runtime.shutting_down.load(Ordering::SeqCst) {
    return Err("VM is shutting down".to_string());
  }
  if member.0.group.data.lock().is_none() {
    return Err("Isolate group has already been cleaned up".to_string());
  }
  Ok(new_isolate(
    &runtime,
    member.0.group.clone(),
    name,
    member.0.flags,
    hooks,
    isolate_data,
  ))
}

pub fn current_isolate() -> Option<VmIsolate> {
  CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn current_or_error() -> Result<VmIsolate, VmError> {
  current_isolate().ok_or_else(|| VmError::api("No current isolate"))
}

pub fn current_isolate_data() -> Option<IsolateData> {
  current_isolate().and_then(|isolate| isolate.data())
}

pub fn current_isolate_group_data() -> Option<GroupData> {
  current_isolate().and_then(|isolate| isolate.group_data())
}

/// Makes `isolate` current on this thread.
///
/// Panics if another isolate is current here, if `isolate` is entered on
/// another thread, or if it has shut down.
pub fn enter_isolate(isolate: &VmIsolate) {
  CURRENT.with(|current| {
    let mut current = current.borrow_mut();
    if let Some(other) = current.as_ref() {
      panic!(
        "Cannot enter isolate {} while isolate {} is current",
        isolate.name(),
        other.name()
      );
    }
    {
      let mut state = isolate.0.state.lock();
      assert!(!state.shut_down, "Isolate {} has shut down", isolate.name());
      assert!(
        state.entered_on.is_none(),
        "Isolate {} is already entered on another thread",
        isolate.name()
      );
      state.entered_on = Some(std::thread::current().id());
    }
    *current = Some(isolate.clone());
  });
}

/// Leaves the current isolate. Panics if there is none.
pub fn exit_isolate() {
  let Some(isolate) = CURRENT.with(|current| current.borrow_mut().take()) else {
    panic!("exit_isolate called without a current isolate");
  };
  isolate.0.state.lock().entered_on = None;
}

/// Enters an isolate for the lifetime of the scope, restoring whatever was
/// current before.
#[must_use]
pub struct IsolateScope {
  isolate: VmIsolate,
  previous: Option<VmIsolate>,
  entered: bool,
}

impl IsolateScope {
  pub fn new(isolate: &VmIsolate) -> Self {
    let previous = current_isolate();
    if previous.as_ref() == Some(isolate) {
      return Self {
        isolate: isolate.clone(),
        previous: None,
        entered: false,
      };
    }
    if previous.is_some() {
      exit_isolate();
    }
    enter_isolate(isolate);
    Self {
      isolate: isolate.clone(),
      previous,
      entered: true,
    }
  }
}

impl Drop for IsolateScope {
  fn drop(&mut self) {
    if self.entered && current_isolate().as_ref() == Some(&self.isolate) {
      exit_isolate();
    }
    if let Some(previous) = self.previous.take() {
      if current_isolate().is_none() && !previous.is_shut_down() {
        enter_isolate(&previous);
      }
    }
  }
}

pub fn isolate_make_runnable(isolate: &VmIsolate) -> Result<(), String> {
  let (pending, notify) = {
    let mut state = isolate.0.state.lock();
    if state.shut_down {
      return Err("Isolate has shut down".to_string());
    }
    if state.entered_on.is_some() {
      return Err("Isolate must not be current when made runnable".to_string());
    }
    if state.runnable {
      return Err("Isolate is already runnable".to_string());
    }
    state.runnable = true;
    (state.messages.len(), state.notify.clone())
  };
  // Messages that arrived early were not handled; announce them again.
  if let Some(notify) = notify {
    for _ in 0..pending {
      notify(isolate);
    }
  }
  Ok(())
}

pub fn set_current_thread_owns_isolate() {
  if let Some(isolate) = current_isolate() {
    isolate.0.state.lock().owner_thread = Some(std::thread::current().id());
  }
}

pub fn current_thread_owns_isolate(port_id: i64) -> bool {
  let Some(runtime) = runtime() else {
    return false;
  };
  let owner = runtime.ports.lock().get(&port_id).and_then(Weak::upgrade);
  owner.is_some_and(|isolate| {
    let state = isolate.state.lock();
    !state.shut_down && state.owner_thread == Some(std::thread::current().id())
  })
}

pub fn sticky_error() -> Option<VmError> {
  current_isolate().and_then(|isolate| isolate.0.state.lock().sticky_error.clone())
}

/// Shuts down the current isolate.
///
/// The shutdown callback runs with the isolate still current. Afterwards the
/// isolate is exited, its payload is handed to the cleanup callback, and the
/// group is cleaned up if this was its last isolate.
pub fn shutdown_isolate() {
  let Some(isolate) = current_isolate() else {
    panic!("shutdown_isolate called without a current isolate");
  };
  {
    let mut state = isolate.0.state.lock();
    assert!(
      !state.shutting_down,
      "Isolate {} is already shutting down",
      isolate.name()
    );
    state.shutting_down = true;
  }
  let runtime = runtime();
  let group_data = isolate.group_data();

  {
    let isolate_data = isolate.data();
    match (&isolate.0.hooks.shutdown, &runtime) {
      (Some(hook), _) => hook(&isolate),
      (None, Some(runtime)) => runtime.callbacks.shutdown_isolate(
        &isolate,
        group_data.as_ref(),
        isolate_data.as_ref(),
      ),
      (None, None) => {}
    }
  }

  let (ports, dropped) = {
    let mut state = isolate.0.state.lock();
    state.shut_down = true;
    state.notify = None;
    state.deferred_load_handler = None;
    let ports: Vec<i64> = state.ports.drain().map(|(id, _)| id).collect();
    let dropped = (
      std::mem::take(&mut state.messages),
      std::mem::take(&mut state.microtasks),
      std::mem::take(&mut state.pending_loading_units),
    );
    state.service_messages.clear();
    (ports, dropped)
  };
  drop(dropped);
  if let Some(runtime) = &runtime {
    let mut registry = runtime.ports.lock();
    for port in ports {
      registry.remove(&port);
    }
    registry.remove(&isolate.0.main_port.port_id);
    drop(registry);
    runtime.isolates.lock().remove(&isolate.0.id);
  }

  exit_isolate();
  isolate.0.wakeup.notify_all();

  let isolate_data = isolate.0.data.lock().take();
  match (&isolate.0.hooks.cleanup, &runtime) {
    (Some(hook), _) => hook(isolate_data),
    (None, Some(runtime)) => {
      runtime.callbacks.cleanup_isolate(group_data, isolate_data)
    }
    (None, None) => drop(isolate_data),
  }

  let group = &isolate.0.group;
  let group_empty = {
    let mut members = group.members.lock();
    members.retain(|member| {
      member
        .upgrade()
        .is_some_and(|member| member.id != isolate.0.id)
    });
    members.is_empty()
  };
  if group_empty {
    let group_data = group.data.lock().take();
    log::debug!("Cleaning up isolate group {}", group.script_uri);
    match &runtime {
      Some(runtime) => runtime.callbacks.cleanup_group(group_data),
      None => drop(group_data),
    }
  }
}

/// Asks every other isolate of `isolate`'s group to terminate.
pub(crate) fn kill_group_members(isolate: &VmIsolate) {
  let members: Vec<VmIsolate> = isolate
    .0
    .group
    .members
    .lock()
    .iter()
    .filter_map(Weak::upgrade)
    .map(VmIsolate)
    .filter(|member| member != isolate)
    .collect();
  for member in members {
    super::message::post_service_message(&member, ServiceMessage::Kill);
  }
}

pub(crate) fn set_fatal_error(isolate: &VmIsolate, error: &VmError) {
  if error.is_fatal() {
    isolate.0.state.lock().sticky_error = Some(error.clone());
  }
}
