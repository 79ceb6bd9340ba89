// Copyright 2018-2025 the Deno authors. MIT license.

use crate::isolate::Isolate;
use crate::mapping::Mapping;
use crate::vm::NativeResolver;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Produces a mapping on demand, e.g. from an embedder-owned buffer.
pub type MappingCallback =
  Arc<dyn Fn() -> Option<Arc<dyn Mapping>> + Send + Sync>;

/// One piece of a kernel program, possibly still being fetched.
pub type KernelPieceFuture = BoxFuture<'static, Option<Arc<dyn Mapping>>>;

/// Yields the kernel pieces of the application, in load order.
pub type KernelsProducer =
  Arc<dyn Fn() -> Vec<KernelPieceFuture> + Send + Sync>;

pub type IsolateCallback = Arc<dyn Fn() + Send + Sync>;
pub type RootIsolateCallback = Arc<dyn Fn(&Isolate) + Send + Sync>;

/// Receives `(error, stack_trace)`. Returns true if the error was handled.
pub type UnhandledExceptionCallback =
  Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Everything the VM and its isolates are configured with.
///
/// ```ignore
/// let settings = Settings {
///   leak_vm: false,
///   start_paused: true,
///   ..Default::default()
/// };
/// ```
#[derive(Clone)]
pub struct Settings {
  // Snapshot resolution. Each blob is searched for in the order: callback,
  // path, `application_library_path` symbols, process symbols.
  pub vm_snapshot_data: Option<MappingCallback>,
  pub vm_snapshot_data_path: String,
  pub vm_snapshot_instr: Option<MappingCallback>,
  pub vm_snapshot_instr_path: String,
  pub isolate_snapshot_data: Option<MappingCallback>,
  pub isolate_snapshot_data_path: String,
  pub isolate_snapshot_instr: Option<MappingCallback>,
  pub isolate_snapshot_instr_path: String,
  pub application_library_path: Vec<String>,
  pub vmservice_snapshot_library_path: Vec<String>,

  /// Kernel pieces for JIT execution.
  pub application_kernels: Option<KernelsProducer>,
  /// Resolves the native symbols referenced by loaded programs.
  pub native_resolver: Option<Arc<dyn NativeResolver>>,

  pub advisory_script_uri: String,
  pub advisory_script_entrypoint: String,

  /// Keep the VM alive for the rest of the process once created.
  pub leak_vm: bool,

  pub enable_vm_service: bool,
  pub vm_service_host: String,
  pub vm_service_port: u16,
  pub disable_service_auth_codes: bool,
  pub enable_service_port_fallback: bool,

  /// Old generation heap size hint in MB, `-1` for the runtime default.
  pub old_gen_heap_size: i64,
  pub enable_serial_gc: bool,
  pub start_paused: bool,
  pub trace_systrace: bool,
  pub trace_startup: bool,
  pub trace_to_file: String,
  pub endless_trace_buffer: bool,
  pub disable_vm_asserts: bool,
  pub enable_vm_profiling: bool,
  /// Passed through to the runtime verbatim.
  pub vm_flags: Vec<String>,

  pub may_insecurely_connect_to_all_domains: bool,
  pub domain_network_policy: String,

  pub isolate_create_callback: Option<IsolateCallback>,
  pub isolate_shutdown_callback: Option<IsolateCallback>,
  pub root_isolate_create_callback: Option<RootIsolateCallback>,
  pub root_isolate_shutdown_callback: Option<IsolateCallback>,
  pub service_isolate_create_callback: Option<IsolateCallback>,
  pub unhandled_exception_callback: Option<UnhandledExceptionCallback>,

  pub log_tag: String,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      vm_snapshot_data: None,
      vm_snapshot_data_path: String::new(),
      vm_snapshot_instr: None,
      vm_snapshot_instr_path: String::new(),
      isolate_snapshot_data: None,
      isolate_snapshot_data_path: String::new(),
      isolate_snapshot_instr: None,
      isolate_snapshot_instr_path: String::new(),
      application_library_path: Vec::new(),
      vmservice_snapshot_library_path: Vec::new(),
      application_kernels: None,
      native_resolver: None,
      advisory_script_uri: "main.dart".to_string(),
      advisory_script_entrypoint: "main".to_string(),
      leak_vm: true,
      enable_vm_service: false,
      vm_service_host: "127.0.0.1".to_string(),
      vm_service_port: 0,
      disable_service_auth_codes: true,
      enable_service_port_fallback: false,
      old_gen_heap_size: -1,
      enable_serial_gc: false,
      start_paused: false,
      trace_systrace: false,
      trace_startup: false,
      trace_to_file: String::new(),
      endless_trace_buffer: false,
      disable_vm_asserts: false,
      enable_vm_profiling: false,
      vm_flags: Vec::new(),
      may_insecurely_connect_to_all_domains: true,
      domain_network_policy: String::new(),
      isolate_create_callback: None,
      isolate_shutdown_callback: None,
      root_isolate_create_callback: None,
      root_isolate_shutdown_callback: None,
      service_isolate_create_callback: None,
      unhandled_exception_callback: None,
      log_tag: "isolate_host".to_string(),
    }
  }
}

impl fmt::Debug for Settings {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Settings")
      .field("vm_snapshot_data_path", &self.vm_snapshot_data_path)
      .field("isolate_snapshot_data_path", &self.isolate_snapshot_data_path)
      .field("application_library_path", &self.application_library_path)
      .field("application_kernels", &self.application_kernels.is_some())
      .field("advisory_script_uri", &self.advisory_script_uri)
      .field("leak_vm", &self.leak_vm)
      .field("enable_vm_service", &self.enable_vm_service)
      .field("vm_service_host", &self.vm_service_host)
      .field("vm_service_port", &self.vm_service_port)
      .field("old_gen_heap_size", &self.old_gen_heap_size)
      .field("start_paused", &self.start_paused)
      .field("vm_flags", &self.vm_flags)
      .field("log_tag", &self.log_tag)
      .finish_non_exhaustive()
  }
}
