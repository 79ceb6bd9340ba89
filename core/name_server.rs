// Copyright 2018-2025 the Deno authors. MIT license.

use crate::vm::PortEx;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Process-wide registry of isolate ports by name, so that isolates can find
/// each other without sharing a group.
#[derive(Debug, Default)]
pub struct IsolateNameServer {
  port_mapping: Mutex<HashMap<String, PortEx>>,
}

impl IsolateNameServer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns [`PortEx::ILLEGAL`] if no port is registered under `name`.
  pub fn lookup_isolate_port_by_name(&self, name: &str) -> PortEx {
    self
      .port_mapping
      .lock()
      .get(name)
      .copied()
      .unwrap_or(PortEx::ILLEGAL)
  }

  /// Returns false, leaving the existing mapping in place, if `name` is
  /// taken.
  pub fn register_isolate_port_with_name(&self, port: PortEx, name: &str) -> bool {
    let mut mapping = self.port_mapping.lock();
    if mapping.contains_key(name) {
      return false;
    }
    mapping.insert(name.to_string(), port);
    true
  }

  pub fn remove_isolate_name_mapping(&self, name: &str) -> bool {
    self.port_mapping.lock().remove(name).is_some()
  }
}
