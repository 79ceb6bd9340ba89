// Copyright 2018-2025 the Deno authors. MIT license.

//! Isolates whose message loop the runtime drives on its own threads.

use super::CreateGroupRequest;
use super::IsolateFlags;
use super::IsolateHooks;
use super::IsolateScope;
use super::VmIsolate;
use super::enter_isolate;
use super::exit_isolate;
use super::isolate::kill_group_members;
use super::isolate::new_isolate_in_group;
use super::isolate_make_runnable;
use super::message;
use super::message::Message;
use super::native::NativeFunction;
use super::runtime;
use super::shutdown_isolate;
use crate::error::VmError;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_millis(50);

fn root_function(
  isolate: &VmIsolate,
  function: &str,
) -> Result<NativeFunction, VmError> {
  let program = isolate.0.group.program.lock();
  let root = program
    .root_library()
    .ok_or_else(|| VmError::api("Isolate group has no root library"))?;
  program.lookup_function(root, function)
}

fn spawn_worker(
  name: &str,
  f: impl FnOnce() + Send + 'static,
) -> Result<(), VmError> {
  let runtime =
    runtime().ok_or_else(|| VmError::api("VM is not initialized"))?;
  if runtime.shutting_down.load(Ordering::SeqCst) {
    return Err(VmError::api("VM is shutting down"));
  }
  let handle = std::thread::Builder::new()
    .name(format!("vm-isolate:{name}"))
    .spawn(f)
    .map_err(|err| VmError::api(format!("Failed to start isolate thread: {err}")))?;
  runtime.workers.lock().push(handle);
  Ok(())
}

/// Spawns an isolate into `parent`'s group that runs `function` of the
/// group's root library. Returns once the new isolate is initialized.
pub(crate) fn spawn_in_group(
  parent: &VmIsolate,
  function: &str,
  args: Vec<String>,
) -> Result<(), VmError> {
  let entrypoint = root_function(parent, function)?;
  let name = format!("{}:{function}", parent.script_uri());
  let isolate =
    new_isolate_in_group(parent, &name, IsolateHooks::default(), None)
      .map_err(VmError::api)?;
  isolate.0.state.lock().vm_managed = true;

  let (tx, rx) = mpsc::channel();
  let child = isolate.clone();
  let started = spawn_worker(&name, move || {
    enter_isolate(&child);
    let Some(runtime) = runtime() else {
      shutdown_isolate();
      let _ = tx.send(Err("VM is not initialized".to_string()));
      return;
    };
    match runtime.callbacks.initialize_isolate(&child) {
      Ok(data) => child.set_data(Some(data)),
      Err(err) => {
        shutdown_isolate();
        let _ = tx.send(Err(err));
        return;
      }
    }
    exit_isolate();
    if !child.is_runnable() {
      if let Err(err) = isolate_make_runnable(&child) {
        enter_isolate(&child);
        shutdown_isolate();
        let _ = tx.send(Err(err));
        return;
      }
    }
    enter_isolate(&child);
    message::enqueue(
      &child,
      Message::Entrypoint {
        function: entrypoint,
        args,
      },
    );
    let _ = tx.send(Ok(()));
    run_loop(&child);
  });

  if let Err(err) = started {
    let _scope = IsolateScope::new(&isolate);
    shutdown_isolate();
    return Err(err);
  }
  rx.recv()
    .unwrap_or_else(|_| Err("Isolate thread exited early".to_string()))
    .map_err(VmError::api)
}

/// Spawns an isolate in a new group for `uri`, created by the embedder's
/// group-create callback, and runs its `main`.
pub(crate) fn spawn_uri(
  parent: &VmIsolate,
  uri: &str,
  args: Vec<String>,
) -> Result<(), VmError> {
  let request = CreateGroupRequest {
    script_uri: uri.to_string(),
    main: "main".to_string(),
    flags: IsolateFlags {
      is_dont_need_safe: parent.flags().is_dont_need_safe,
      ..Default::default()
    },
    parent_data: parent.data(),
  };
  let (tx, rx) = mpsc::channel();
  spawn_worker(uri, move || {
    let Some(runtime) = runtime() else {
      let _ = tx.send(Err("VM is not initialized".to_string()));
      return;
    };
    let main = request.main.clone();
    let isolate = match runtime.callbacks.create_group(request) {
      Ok(Some(isolate)) => isolate,
      Ok(None) => {
        let _ = tx.send(Err("Isolate group creation was declined".to_string()));
        return;
      }
      Err(err) => {
        let _ = tx.send(Err(err));
        return;
      }
    };
    isolate.0.state.lock().vm_managed = true;
    enter_isolate(&isolate);
    match root_function(&isolate, &main) {
      Ok(function) => {
        message::enqueue(&isolate, Message::Entrypoint { function, args });
        let _ = tx.send(Ok(()));
        run_loop(&isolate);
      }
      Err(err) => {
        shutdown_isolate();
        let _ = tx.send(Err(err.message));
      }
    }
  })?;
  rx.recv()
    .unwrap_or_else(|_| Err("Isolate thread exited early".to_string()))
    .map_err(VmError::api)
}

/// Runs the service isolate's message loop on a runtime thread.
pub(crate) fn run_service_isolate(isolate: VmIsolate) -> Result<(), VmError> {
  isolate.0.state.lock().vm_managed = true;
  let name = isolate.name().to_string();
  spawn_worker(&name, move || {
    enter_isolate(&isolate);
    if let Ok(function) = root_function(&isolate, "main") {
      message::enqueue(
        &isolate,
        Message::Entrypoint {
          function,
          args: Vec::new(),
        },
      );
    }
    run_loop(&isolate);
  })
}

fn has_pending_work(isolate: &VmIsolate) -> bool {
  let state = isolate.0.state.lock();
  !state.messages.is_empty()
    || !state.service_messages.is_empty()
    || !state.microtasks.is_empty()
}

fn wait_for_work(isolate: &VmIsolate) {
  let mut state = isolate.0.state.lock();
  if state.messages.is_empty() && state.service_messages.is_empty() {
    isolate.0.wakeup.wait_for(&mut state, IDLE_WAIT);
  }
}

fn vm_shutting_down() -> bool {
  runtime().is_none_or(|runtime| runtime.shutting_down.load(Ordering::SeqCst))
}

/// The message loop of a runtime-driven isolate. The isolate is current on
/// entry and shut down on return.
fn run_loop(isolate: &VmIsolate) {
  if message::should_pause_on_start() {
    message::set_paused_on_start(true);
  }
  loop {
    if vm_shutting_down() {
      break;
    }
    if message::is_paused_on_start() || message::is_paused_on_exit() {
      match message::handle_service_messages() {
        Ok(true) => {
          if message::is_paused_on_exit() {
            message::set_paused_on_exit(false);
            break;
          }
          message::set_paused_on_start(false);
        }
        Ok(false) => wait_for_work(isolate),
        Err(_) => break,
      }
      continue;
    }
    match message::handle_message() {
      Ok(()) => {}
      Err(error) if error.is_fatal() => {
        log::debug!("Isolate {} terminated: {error}", isolate.name());
        if isolate.is_group_root() {
          kill_group_members(isolate);
        }
        break;
      }
      Err(error) => {
        log::error!("Unhandled exception in isolate {}: {error}", isolate.name());
      }
    }
    if has_pending_work(isolate) {
      continue;
    }
    if !isolate.is_service_isolate() && !message::has_live_ports() {
      if message::should_pause_on_exit() {
        message::set_paused_on_exit(true);
        continue;
      }
      break;
    }
    wait_for_work(isolate);
  }
  shutdown_isolate();
}
