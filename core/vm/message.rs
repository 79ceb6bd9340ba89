// Copyright 2018-2025 the Deno authors. MIT license.

use super::VmIsolate;
use super::isolate::MessageNotifyCallback;
use super::isolate::current_or_error;
use super::isolate::set_fatal_error;
use super::native::Microtask;
use super::native::NativeFunction;
use super::native::NativeScope;
use super::native::PortHandler;
use super::runtime;
use crate::error::VmError;
use serde_json::Value;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

pub const ILLEGAL_PORT: i64 = 0;

/// A port identifier together with the main port of the isolate that
/// opened it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PortEx {
  pub port_id: i64,
  pub origin_id: i64,
}

impl PortEx {
  pub const ILLEGAL: PortEx = PortEx {
    port_id: ILLEGAL_PORT,
    origin_id: ILLEGAL_PORT,
  };

  pub fn is_illegal(&self) -> bool {
    self.port_id == ILLEGAL_PORT
  }
}

/// Out-of-band messages, handled ahead of ordinary ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceMessage {
  /// Leave the paused-on-start or paused-on-exit state.
  Resume,
  /// Terminate the isolate.
  Kill,
}

pub(crate) enum Message {
  Data {
    port: i64,
    value: Value,
  },
  Entrypoint {
    function: NativeFunction,
    args: Vec<String>,
  },
}

static NEXT_PORT: AtomicI64 = AtomicI64::new(ILLEGAL_PORT + 1);

pub(crate) fn new_port_id() -> i64 {
  NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn open_port(isolate: &VmIsolate, handler: PortHandler) -> PortEx {
  let port_id = new_port_id();
  isolate.0.state.lock().ports.insert(port_id, handler);
  if let Some(runtime) = runtime() {
    runtime
      .ports
      .lock()
      .insert(port_id, Arc::downgrade(&isolate.0));
  }
  PortEx {
    port_id,
    origin_id: isolate.0.main_port.port_id,
  }
}

pub(crate) fn close_port(isolate: &VmIsolate, port: PortEx) -> bool {
  let removed = isolate.0.state.lock().ports.remove(&port.port_id).is_some();
  if removed {
    if let Some(runtime) = runtime() {
      runtime.ports.lock().remove(&port.port_id);
    }
  }
  removed
}

/// Posts `value` to `port`. Callable from any thread; returns false if the
/// port is closed or its isolate is gone.
pub fn post(port: PortEx, value: Value) -> bool {
  let Some(runtime) = runtime() else {
    return false;
  };
  let owner = runtime.ports.lock().get(&port.port_id).and_then(Weak::upgrade);
  match owner {
    Some(owner) => enqueue(
      &VmIsolate(owner),
      Message::Data {
        port: port.port_id,
        value,
      },
    ),
    None => false,
  }
}

pub(crate) fn enqueue(isolate: &VmIsolate, message: Message) -> bool {
  let notify = {
    let mut state = isolate.0.state.lock();
    if state.shut_down || state.shutting_down {
      return false;
    }
    if let Message::Data { port, .. } = &message {
      if !state.ports.contains_key(port) {
        return false;
      }
    }
    state.messages.push_back(message);
    state.notify.clone()
  };
  isolate.0.wakeup.notify_all();
  if let Some(notify) = notify {
    notify(isolate);
  }
  true
}

pub fn post_service_message(isolate: &VmIsolate, message: ServiceMessage) -> bool {
  let notify = {
    let mut state = isolate.0.state.lock();
    if state.shut_down || state.shutting_down {
      return false;
    }
    state.service_messages.push_back(message);
    state.notify.clone()
  };
  isolate.0.wakeup.notify_all();
  if let Some(notify) = notify {
    notify(isolate);
  }
  true
}

pub(crate) fn schedule_microtask(isolate: &VmIsolate, task: Microtask) {
  isolate.0.state.lock().microtasks.push_back(task);
}

pub fn main_port() -> Result<PortEx, VmError> {
  Ok(current_or_error()?.main_port())
}

/// Sets the callback told about every message posted to the current
/// isolate. `None` stops notifications.
pub fn set_message_notify_callback(callback: Option<MessageNotifyCallback>) {
  if let Some(isolate) = super::current_isolate() {
    isolate.0.state.lock().notify = callback;
  }
}

pub fn has_service_messages() -> bool {
  super::current_isolate()
    .is_some_and(|isolate| !isolate.0.state.lock().service_messages.is_empty())
}

/// Handles all pending service messages of the current isolate. Returns
/// whether a resume was requested; a kill request is returned as a fatal
/// error.
pub fn handle_service_messages() -> Result<bool, VmError> {
  let isolate = current_or_error()?;
  let messages = std::mem::take(&mut isolate.0.state.lock().service_messages);
  let mut resume = false;
  for message in messages {
    match message {
      ServiceMessage::Resume => resume = true,
      ServiceMessage::Kill => {
        let error =
          VmError::unwind(format!("isolate {} was killed", isolate.name()));
        set_fatal_error(&isolate, &error);
        return Err(error);
      }
    }
  }
  Ok(resume)
}

/// Handles pending service messages, then at most one ordinary message,
/// then every microtask that became due.
pub fn handle_message() -> Result<(), VmError> {
  let isolate = current_or_error()?;
  handle_service_messages()?;

  let work = {
    let mut state = isolate.0.state.lock();
    if state.shut_down {
      return Err(VmError::api("Isolate has shut down"));
    }
    if !state.runnable {
      return Ok(());
    }
    match state.messages.pop_front() {
      None => None,
      Some(Message::Data { port, value }) => state
        .ports
        .get(&port)
        .cloned()
        .map(|handler| Work::Port(handler, value)),
      Some(Message::Entrypoint { function, args }) => {
        Some(Work::Entrypoint(function, args))
      }
    }
  };

  let mut scope = NativeScope::new(isolate.clone());
  let result = match work {
    None => Ok(()),
    Some(Work::Port(handler, value)) => handler(&mut scope, value),
    Some(Work::Entrypoint(function, args)) => function(&mut scope, &args[..]),
  }
  .and_then(|_| drain_microtasks(&isolate));
  if let Err(error) = &result {
    set_fatal_error(&isolate, error);
  }
  result
}

enum Work {
  Port(PortHandler, Value),
  Entrypoint(NativeFunction, Vec<String>),
}

pub(crate) fn drain_microtasks(isolate: &VmIsolate) -> Result<(), VmError> {
  loop {
    let task = isolate.0.state.lock().microtasks.pop_front();
    let Some(task) = task else {
      return Ok(());
    };
    let mut scope = NativeScope::new(isolate.clone());
    task(&mut scope)?;
  }
}

/// Whether the current isolate still has open receive ports or queued work.
pub fn has_live_ports() -> bool {
  super::current_isolate().is_some_and(|isolate| {
    let state = isolate.0.state.lock();
    !state.ports.is_empty() || !state.messages.is_empty()
  })
}

pub fn should_pause_on_start() -> bool {
  super::current_isolate()
    .is_some_and(|isolate| isolate.0.state.lock().should_pause_on_start)
}

pub fn is_paused_on_start() -> bool {
  super::current_isolate()
    .is_some_and(|isolate| isolate.0.state.lock().paused_on_start)
}

pub fn set_paused_on_start(paused: bool) {
  set_paused(paused, |state| &mut state.paused_on_start);
}

pub fn should_pause_on_exit() -> bool {
  super::current_isolate()
    .is_some_and(|isolate| isolate.0.state.lock().should_pause_on_exit)
}

pub fn is_paused_on_exit() -> bool {
  super::current_isolate()
    .is_some_and(|isolate| isolate.0.state.lock().paused_on_exit)
}

pub fn set_paused_on_exit(paused: bool) {
  set_paused(paused, |state| &mut state.paused_on_exit);
}

fn set_paused(
  paused: bool,
  flag: impl FnOnce(&mut super::isolate::IsolateState) -> &mut bool,
) {
  let Some(isolate) = super::current_isolate() else {
    return;
  };
  let resumed = {
    let mut state = isolate.0.state.lock();
    let flag = flag(&mut *state);
    let was_paused = std::mem::replace(flag, paused);
    (was_paused && !paused).then(|| (state.messages.len(), state.notify.clone()))
  };
  // Notifications consumed while paused were not acted on.
  if let Some((pending, Some(notify))) = resumed {
    for _ in 0..pending {
      notify(&isolate);
    }
  }
}
