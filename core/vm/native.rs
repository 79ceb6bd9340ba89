// Copyright 2018-2025 the Deno authors. MIT license.

use super::PortEx;
use super::VmIsolate;
use crate::error::VmError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The implementation of a program function.
pub type NativeFunction =
  Arc<dyn Fn(&mut NativeScope, &[String]) -> Result<(), VmError> + Send + Sync>;

/// Receives the messages posted to a port.
pub type PortHandler =
  Arc<dyn Fn(&mut NativeScope, Value) -> Result<(), VmError> + Send + Sync>;

pub type Microtask =
  Box<dyn FnOnce(&mut NativeScope) -> Result<(), VmError> + Send + 'static>;

/// Completes a deferred library load, with an error message on failure.
pub type LoadingUnitCompleter = Box<
  dyn FnOnce(&mut NativeScope, Result<(), String>) -> Result<(), VmError>
    + Send
    + 'static,
>;

/// Maps native symbols named by a program to their implementations.
pub trait NativeResolver: Send + Sync {
  fn resolve(&self, symbol: &str) -> Option<NativeFunction>;
}

#[derive(Clone, Default)]
pub struct NativeRegistry {
  natives: HashMap<String, NativeFunction>,
}

impl NativeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(
    &mut self,
    symbol: impl Into<String>,
    function: impl Fn(&mut NativeScope, &[String]) -> Result<(), VmError>
    + Send
    + Sync
    + 'static,
  ) -> &mut Self {
    self.natives.insert(symbol.into(), Arc::new(function));
    self
  }

  pub fn contains(&self, symbol: &str) -> bool {
    self.natives.contains_key(symbol)
  }
}

impl NativeResolver for NativeRegistry {
  fn resolve(&self, symbol: &str) -> Option<NativeFunction> {
    self.natives.get(symbol).cloned()
  }
}

/// What a native function can do to the isolate it runs in.
pub struct NativeScope {
  isolate: VmIsolate,
}

impl NativeScope {
  pub(crate) fn new(isolate: VmIsolate) -> Self {
    Self { isolate }
  }

  pub fn isolate(&self) -> &VmIsolate {
    &self.isolate
  }

  /// Opens a receive port. The isolate stays alive while it has open ports.
  pub fn open_port(
    &mut self,
    handler: impl Fn(&mut NativeScope, Value) -> Result<(), VmError>
    + Send
    + Sync
    + 'static,
  ) -> PortEx {
    super::message::open_port(&self.isolate, Arc::new(handler))
  }

  pub fn close_port(&mut self, port: PortEx) -> bool {
    super::message::close_port(&self.isolate, port)
  }

  pub fn post(&mut self, port: PortEx, message: Value) -> bool {
    super::message::post(port, message)
  }

  pub fn schedule_microtask(
    &mut self,
    task: impl FnOnce(&mut NativeScope) -> Result<(), VmError> + Send + 'static,
  ) {
    super::message::schedule_microtask(&self.isolate, Box::new(task));
  }

  /// Requests deferred loading unit `loading_unit_id`. The completer runs as
  /// a microtask once the embedder reports success or failure.
  pub fn load_loading_unit(
    &mut self,
    loading_unit_id: i64,
    completer: impl FnOnce(&mut NativeScope, Result<(), String>) -> Result<(), VmError>
    + Send
    + 'static,
  ) -> Result<(), VmError> {
    super::program::request_loading_unit(
      &self.isolate,
      loading_unit_id,
      Box::new(completer),
    )
  }

  /// Spawns an isolate in this isolate's group running `function` from the
  /// root library on a runtime-owned thread.
  pub fn spawn(
    &mut self,
    function: &str,
    args: Vec<String>,
  ) -> Result<(), VmError> {
    super::spawn::spawn_in_group(&self.isolate, function, args)
  }

  /// Spawns an isolate in a new group created for `uri`.
  pub fn spawn_uri(
    &mut self,
    uri: &str,
    args: Vec<String>,
  ) -> Result<(), VmError> {
    super::spawn::spawn_uri(&self.isolate, uri, args)
  }

  /// The error to return from a native to terminate the isolate.
  pub fn exit(&mut self) -> VmError {
    VmError::unwind(format!("isolate {} exited", self.isolate.name()))
  }
}
