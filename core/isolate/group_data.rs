// Copyright 2018-2025 the Deno authors. MIT license.

use super::Isolate;
use crate::error::IsolateError;
use crate::mapping::Mapping;
use crate::native_assets::NativeAssetsManager;
use crate::platform_message::PlatformMessage;
use crate::platform_message::PlatformMessageHandler;
use crate::settings::IsolateCallback;
use crate::settings::Settings;
use crate::snapshot::Snapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

/// Prepares an isolate spawned into an existing group the same way the
/// group's root isolate was prepared.
pub type ChildIsolatePreparer =
  Arc<dyn Fn(&Isolate) -> Result<(), IsolateError> + Send + Sync>;

#[derive(Clone)]
pub struct IsolateGroupOptions {
  pub settings: Settings,
  pub isolate_snapshot: Arc<Snapshot>,
  pub advisory_script_uri: String,
  pub advisory_script_entrypoint: String,
  pub child_isolate_preparer: Option<ChildIsolatePreparer>,
  pub isolate_create_callback: Option<IsolateCallback>,
  pub isolate_shutdown_callback: Option<IsolateCallback>,
  pub native_assets_manager: Option<Arc<NativeAssetsManager>>,
}

/// State shared by every isolate of a group.
///
/// Created together with the group's first isolate and released by the
/// runtime's group-cleanup callback once the last isolate is gone.
pub struct IsolateGroupData {
  settings: Settings,
  isolate_snapshot: Arc<Snapshot>,
  advisory_script_uri: String,
  advisory_script_entrypoint: String,
  child_isolate_preparer: Mutex<Option<ChildIsolatePreparer>>,
  isolate_create_callback: Option<IsolateCallback>,
  isolate_shutdown_callback: Option<IsolateCallback>,
  native_assets_manager: Option<Arc<NativeAssetsManager>>,
  // Keyed by root isolate token.
  platform_message_handlers: Mutex<HashMap<i64, Weak<dyn PlatformMessageHandler>>>,
  // Retained until the group shuts down; child isolates are prepared from
  // these.
  kernel_buffers: Mutex<Vec<Arc<dyn Mapping>>>,
}

impl IsolateGroupData {
  pub fn new(options: IsolateGroupOptions) -> Self {
    Self {
      settings: options.settings,
      isolate_snapshot: options.isolate_snapshot,
      advisory_script_uri: options.advisory_script_uri,
      advisory_script_entrypoint: options.advisory_script_entrypoint,
      child_isolate_preparer: Mutex::new(options.child_isolate_preparer),
      isolate_create_callback: options.isolate_create_callback,
      isolate_shutdown_callback: options.isolate_shutdown_callback,
      native_assets_manager: options.native_assets_manager,
      platform_message_handlers: Mutex::new(HashMap::new()),
      kernel_buffers: Mutex::new(Vec::new()),
    }
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn isolate_snapshot(&self) -> &Arc<Snapshot> {
    &self.isolate_snapshot
  }

  pub fn advisory_script_uri(&self) -> &str {
    &self.advisory_script_uri
  }

  pub fn advisory_script_entrypoint(&self) -> &str {
    &self.advisory_script_entrypoint
  }

  pub fn child_isolate_preparer(&self) -> Option<ChildIsolatePreparer> {
    self.child_isolate_preparer.lock().clone()
  }

  pub fn set_child_isolate_preparer(&self, preparer: ChildIsolatePreparer) {
    *self.child_isolate_preparer.lock() = Some(preparer);
  }

  pub fn isolate_create_callback(&self) -> Option<&IsolateCallback> {
    self.isolate_create_callback.as_ref()
  }

  pub fn isolate_shutdown_callback(&self) -> Option<&IsolateCallback> {
    self.isolate_shutdown_callback.as_ref()
  }

  pub fn native_assets_manager(&self) -> Option<&Arc<NativeAssetsManager>> {
    self.native_assets_manager.as_ref()
  }

  /// Registers the handler that receives platform messages sent by isolates
  /// holding `root_isolate_token`. The group does not keep it alive.
  pub fn set_platform_message_handler(
    &self,
    root_isolate_token: i64,
    handler: Weak<dyn PlatformMessageHandler>,
  ) {
    self
      .platform_message_handlers
      .lock()
      .insert(root_isolate_token, handler);
  }

  pub fn platform_message_handler(
    &self,
    root_isolate_token: i64,
  ) -> Option<Arc<dyn PlatformMessageHandler>> {
    self
      .platform_message_handlers
      .lock()
      .get(&root_isolate_token)
      .and_then(Weak::upgrade)
  }

  /// Routes `message` to the handler registered for `root_isolate_token`.
  /// Returns false if there is none or it has been dropped.
  pub fn send_platform_message(
    &self,
    root_isolate_token: i64,
    message: PlatformMessage,
  ) -> bool {
    let Some(handler) = self.platform_message_handler(root_isolate_token) else {
      log::debug!(
        "No platform message handler for root isolate token {root_isolate_token}"
      );
      return false;
    };
    handler.handle_platform_message(message);
    true
  }

  pub fn add_kernel_buffer(&self, buffer: Arc<dyn Mapping>) {
    self.kernel_buffers.lock().push(buffer);
  }

  pub fn kernel_buffers(&self) -> Vec<Arc<dyn Mapping>> {
    self.kernel_buffers.lock().clone()
  }
}
