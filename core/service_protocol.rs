// Copyright 2018-2025 the Deno authors. MIT license.

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Lists every registered view, answered by the registry itself.
pub const LIST_VIEWS_METHOD: &str = "_host.listViews";

const VIEW_ID_PREFIX: &str = "_hostView/";
const SERVER_ERROR_CODE: i64 = -32000;

pub type HandlerId = u64;

/// What the service protocol reports about a handler in `listViews`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HandlerDescription {
  pub isolate_port: i64,
  pub isolate_name: String,
}

/// Answers service protocol requests addressed to one view.
pub trait ServiceProtocolHandler: Send + Sync {
  fn description(&self) -> HandlerDescription;

  /// `Ok` values become the response's `result`, `Err` a server error.
  fn handle_service_protocol_message(
    &self,
    method: &str,
    params: &HashMap<String, String>,
  ) -> Result<Value, String>;
}

struct HandlerEntry {
  handler: Arc<dyn ServiceProtocolHandler>,
  description: HandlerDescription,
}

/// The registry behind the VM service's extension methods.
#[derive(Default)]
pub struct ServiceProtocol {
  handlers: RwLock<BTreeMap<HandlerId, HandlerEntry>>,
  next_id: AtomicU64,
  hooks_enabled: AtomicBool,
}

fn view_id(id: HandlerId) -> String {
  format!("{VIEW_ID_PREFIX}0x{id:x}")
}

fn parse_view_id(view_id: &str) -> Option<HandlerId> {
  let hex = view_id.strip_prefix(VIEW_ID_PREFIX)?.strip_prefix("0x")?;
  HandlerId::from_str_radix(hex, 16).ok()
}

fn server_error(details: &str) -> Value {
  json!({
    "error": {
      "code": SERVER_ERROR_CODE,
      "message": "Server error",
      "data": { "details": details },
    }
  })
}

impl ServiceProtocol {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_handler(&self, handler: Arc<dyn ServiceProtocolHandler>) -> HandlerId {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let description = handler.description();
    self.handlers.write().insert(
      id,
      HandlerEntry {
        handler,
        description,
      },
    );
    id
  }

  pub fn remove_handler(&self, id: HandlerId) -> bool {
    self.handlers.write().remove(&id).is_some()
  }

  pub fn set_handler_description(
    &self,
    id: HandlerId,
    description: HandlerDescription,
  ) -> bool {
    match self.handlers.write().get_mut(&id) {
      Some(entry) => {
        entry.description = description;
        true
      }
      None => false,
    }
  }

  /// Enables or disables routing of extension methods to handlers.
  pub fn toggle_hooks(&self, set: bool) {
    self.hooks_enabled.store(set, Ordering::SeqCst);
    log::debug!(
      "Service protocol hooks {}",
      if set { "enabled" } else { "disabled" }
    );
  }

  pub fn hooks_enabled(&self) -> bool {
    self.hooks_enabled.load(Ordering::SeqCst)
  }

  /// Handles one request and returns the JSON response.
  ///
  /// Requests are routed by their `viewId` parameter. Requests without one
  /// go to the only handler when there is exactly one.
  pub fn handle_message(
    &self,
    method: &str,
    params: &HashMap<String, String>,
  ) -> Value {
    if method == LIST_VIEWS_METHOD {
      return self.list_views();
    }
    if !self.hooks_enabled() {
      return server_error("Service protocol hooks are not enabled.");
    }
    let handler = {
      let handlers = self.handlers.read();
      if handlers.is_empty() {
        return server_error("There are no running service protocol handlers.");
      }
      let by_view = params
        .get("viewId")
        .and_then(|view| parse_view_id(view))
        .and_then(|id| handlers.get(&id));
      match by_view {
        Some(entry) => Some(entry.handler.clone()),
        None if handlers.len() == 1 => {
          handlers.values().next().map(|entry| entry.handler.clone())
        }
        None => None,
      }
    };
    let Some(handler) = handler else {
      return server_error(
        "Service protocol could not handle or find a handler for the requested method.",
      );
    };
    match handler.handle_service_protocol_message(method, params) {
      Ok(result) => json!({ "result": result }),
      Err(details) => server_error(&details),
    }
  }

  fn list_views(&self) -> Value {
    let handlers = self.handlers.read();
    let views: Vec<Value> = handlers
      .iter()
      .map(|(id, entry)| {
        json!({
          "type": "HostView",
          "id": view_id(*id),
          "isolate": {
            "type": "@Isolate",
            "fixedId": true,
            "id": format!("isolates/{}", entry.description.isolate_port),
            "name": entry.description.isolate_name,
            "number": entry.description.isolate_port.to_string(),
          },
        })
      })
      .collect();
    json!({
      "result": {
        "type": "HostViewList",
        "views": views,
      }
    })
  }
}
