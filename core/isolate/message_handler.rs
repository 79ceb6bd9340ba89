// Copyright 2018-2025 the Deno authors. MIT license.

use super::Isolate;
use crate::error::VmError;
use crate::error::VmErrorKind;
use crate::tasks::Task;
use crate::vm;
use crate::vm::IsolateScope;
use crate::vm::VmIsolate;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Posts message-handling work onto the isolate's task runner.
pub type TaskDispatcher = Arc<dyn Fn(Task) + Send + Sync>;

/// Drives an isolate's message queue from its task runner.
///
/// The runtime announces every message through the notify callback, on
/// whatever thread posted it. Each announcement becomes one task on the
/// isolate's runner, so messages are handled one at a time and in order.
#[derive(Default)]
pub struct MessageHandler {
  task_dispatcher: Mutex<Option<TaskDispatcher>>,
  handled_first_message: AtomicBool,
  isolate_exited: AtomicBool,
  isolate_had_uncaught_exception_error: AtomicBool,
  isolate_had_fatal_error: AtomicBool,
  isolate_last_error: Mutex<Option<VmErrorKind>>,
}

fn message_notify_callback(vm_isolate: &VmIsolate) {
  let Some(isolate) = Isolate::from_vm(vm_isolate) else {
    return;
  };
  if isolate.is_shutting_down() {
    return;
  }
  isolate.message_handler().on_message(&isolate);
}

impl MessageHandler {
  /// Binds the handler to the current isolate. Can only be called once.
  pub(crate) fn initialize(&self, dispatcher: TaskDispatcher) {
    {
      let mut slot = self.task_dispatcher.lock();
      assert!(slot.is_none(), "Message handler was initialized twice");
      *slot = Some(dispatcher);
    }
    vm::set_message_notify_callback(Some(Arc::new(message_notify_callback)));
  }

  fn on_message(&self, isolate: &Arc<Isolate>) {
    let Some(dispatcher) = self.task_dispatcher.lock().clone() else {
      return;
    };
    let weak = Arc::downgrade(isolate);
    dispatcher(Box::new(move || {
      if let Some(isolate) = weak.upgrade() {
        isolate.message_handler().on_handle_message(&isolate);
      }
    }));
  }

  fn on_handle_message(&self, isolate: &Isolate) {
    if self.isolate_had_fatal_error.load(Ordering::SeqCst) {
      // Nothing more to do.
      return;
    }
    let Some(vm_isolate) = isolate.vm_isolate() else {
      return;
    };
    if vm_isolate.is_shut_down() {
      return;
    }
    let _scope = IsolateScope::new(vm_isolate);

    let mut result = Ok(());

    if !self.handled_first_message.swap(true, Ordering::SeqCst)
      && vm::should_pause_on_start()
    {
      vm::set_paused_on_start(true);
    }

    if vm::is_paused_on_start() {
      // Only service messages are handled while paused, until one of them
      // resumes the isolate.
      if !vm::has_service_messages() {
        return;
      }
      match vm::handle_service_messages() {
        Ok(false) => return,
        Ok(true) => {
          vm::set_paused_on_start(false);
          result = vm::handle_message();
          Self::run_epilogue(isolate, &result);
          if vm::current_isolate().is_none() {
            self.isolate_exited.store(true, Ordering::SeqCst);
            return;
          }
        }
        Err(error) => result = Err(error),
      }
    } else if vm::is_paused_on_exit() {
      if !vm::has_service_messages() {
        return;
      }
      match vm::handle_service_messages() {
        Ok(false) => return,
        Ok(true) => {
          // Resuming a paused-on-exit isolate lets it finish exiting.
          vm::set_paused_on_exit(false);
          self.isolate_exited.store(true, Ordering::SeqCst);
          return;
        }
        Err(error) => result = Err(error),
      }
    } else {
      result = vm::handle_message();
      Self::run_epilogue(isolate, &result);
      if vm::current_isolate().is_none() {
        self.isolate_exited.store(true, Ordering::SeqCst);
        return;
      }
    }

    match result {
      Err(error) => self.unhandled_error(isolate, vm_isolate, error),
      Ok(()) if !vm::has_live_ports() => {
        if !vm::is_paused_on_exit() && vm::should_pause_on_exit() {
          vm::set_paused_on_exit(true);
        } else {
          self.isolate_exited.store(true, Ordering::SeqCst);
        }
      }
      Ok(()) => {}
    }
  }

  fn run_epilogue(isolate: &Isolate, result: &Result<(), VmError>) {
    if let Some(epilogue) = isolate.message_epilogue() {
      epilogue(result);
    }
  }

  fn unhandled_error(
    &self,
    isolate: &Isolate,
    vm_isolate: &VmIsolate,
    error: VmError,
  ) {
    *self.isolate_last_error.lock() = Some(error.kind);
    self
      .isolate_had_uncaught_exception_error
      .store(true, Ordering::SeqCst);

    if error.is_fatal() {
      self.isolate_had_fatal_error.store(true, Ordering::SeqCst);
      log::debug!(
        "Fatal error in isolate {}: {error}",
        isolate.advisory_script_entrypoint()
      );
      // Stop taking messages, then take the rest of the group down with a
      // root isolate.
      vm::set_message_notify_callback(None);
      if vm_isolate.is_group_root() {
        vm::kill_group_members(vm_isolate);
      }
      vm::shutdown_isolate();
      return;
    }

    let stack_trace = error.stack_trace.as_deref().unwrap_or_default();
    isolate.report_unhandled_exception(&error.message, stack_trace);
  }

  pub fn handled_first_message(&self) -> bool {
    self.handled_first_message.load(Ordering::SeqCst)
  }

  pub fn isolate_exited(&self) -> bool {
    self.isolate_exited.load(Ordering::SeqCst)
  }

  pub fn isolate_had_uncaught_exception_error(&self) -> bool {
    self
      .isolate_had_uncaught_exception_error
      .load(Ordering::SeqCst)
  }

  pub fn isolate_had_fatal_error(&self) -> bool {
    self.isolate_had_fatal_error.load(Ordering::SeqCst)
  }

  pub fn isolate_last_error(&self) -> Option<VmErrorKind> {
    *self.isolate_last_error.lock()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn starts_clean() {
    let handler = MessageHandler::default();
    assert!(!handler.handled_first_message());
    assert!(!handler.isolate_exited());
    assert!(!handler.isolate_had_uncaught_exception_error());
    assert!(!handler.isolate_had_fatal_error());
    assert_eq!(handler.isolate_last_error(), None);
  }
}
