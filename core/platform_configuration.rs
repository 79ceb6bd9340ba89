// Copyright 2018-2025 the Deno authors. MIT license.

use crate::isolate::PlatformIsolateManager;
use std::sync::Arc;

/// The platform side of a root isolate: what the isolate needs from the
/// engine that hosts it.
pub trait PlatformConfiguration: Send + Sync {
  /// The managed program asked for deferred loading unit `loading_unit_id`.
  /// The engine answers later through `Isolate::load_loading_unit` or
  /// `Isolate::load_loading_unit_error`.
  fn request_deferred_library(&self, loading_unit_id: i64);

  /// The manager tracking the platform isolates spawned from this root
  /// isolate.
  fn platform_isolate_manager(&self) -> Arc<PlatformIsolateManager>;

  /// First chance at an unhandled exception. Returns true if it was
  /// handled.
  fn on_error(&self, _error: &str, _stack_trace: &str) -> bool {
    false
  }
}
