// Copyright 2018-2025 the Deno authors. MIT license.

use self::snapshot::ROOT_LIBRARY;
use self::snapshot::create_isolate_snapshot;
use self::snapshot::create_vm_snapshot;
use self::snapshot::main_kernel;
use futures::FutureExt;
use isolate_host::Isolate;
use isolate_host::Mapping;
use isolate_host::MappingCallback;
use isolate_host::PlatformConfiguration;
use isolate_host::PlatformIsolateManager;
use isolate_host::Settings;
use isolate_host::VmError;
use isolate_host::vm::NativeRegistry;
use isolate_host::vm::NativeScope;
use isolate_host::vm::PortEx;
use parking_lot::Condvar;
use parking_lot::Mutex;
use serde_json::Value;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub mod snapshot;
#[cfg(test)]
pub mod testing;
pub mod thread_host;

const OUTPUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lines recorded by natives and callbacks, in the order they happened.
#[derive(Clone, Default)]
pub struct Output {
  lines: Arc<Mutex<Vec<String>>>,
  changed: Arc<Condvar>,
}

impl Output {
  pub fn line(&self, line: impl Into<String>) {
    self.lines.lock().push(line.into());
    self.changed.notify_all();
  }

  pub fn lines(&self) -> Vec<String> {
    self.lines.lock().clone()
  }

  pub fn contains(&self, line: &str) -> bool {
    self.lines.lock().iter().any(|l| l == line)
  }

  /// Waits until `line` has been recorded. Returns false on timeout.
  pub fn wait_for(&self, line: &str) -> bool {
    let mut lines = self.lines.lock();
    let _ = self.changed.wait_while_for(
      &mut lines,
      |lines| !lines.iter().any(|l| l == line),
      OUTPUT_TIMEOUT,
    );
    lines.iter().any(|l| l == line)
  }

  pub fn take(&self) -> Vec<String> {
    std::mem::take(&mut *self.lines.lock())
  }
}

/// The program, natives and settings isolates are created from.
///
/// Every function of [`main_kernel`] is backed by a native that records
/// what it did in [`Fixture::output`].
#[derive(Clone)]
pub struct Fixture {
  output: Output,
  registry: NativeRegistry,
  kernels: Vec<Vec<u8>>,
  keep_alive_port: Arc<Mutex<Option<PortEx>>>,
}

impl Default for Fixture {
  fn default() -> Self {
    Self::new()
  }
}

impl Fixture {
  pub fn new() -> Self {
    let mut fixture = Self {
      output: Output::default(),
      registry: NativeRegistry::new(),
      kernels: vec![main_kernel().to_bytes()],
      keep_alive_port: Default::default(),
    };
    fixture.register_natives();
    fixture
  }

  pub fn output(&self) -> &Output {
    &self.output
  }

  /// Replaces the kernel pieces isolates are loaded from, in load order.
  pub fn set_kernels(&mut self, kernels: Vec<Vec<u8>>) -> &mut Self {
    self.kernels = kernels;
    self
  }

  pub fn register(
    &mut self,
    symbol: &str,
    function: impl Fn(&mut NativeScope, &[String]) -> Result<(), VmError>
    + Send
    + Sync
    + 'static,
  ) -> &mut Self {
    self.registry.register(symbol, function);
    self
  }

  /// The port opened by the `keepAlive` native, until it is closed.
  pub fn keep_alive_port(&self) -> Option<PortEx> {
    *self.keep_alive_port.lock()
  }

  /// Settings for a VM that does not outlive its last reference.
  pub fn settings(&self) -> Settings {
    let pieces = self.kernels.clone();
    let output = self.output.clone();
    Settings {
      vm_snapshot_data: Some(mapping_callback(create_vm_snapshot())),
      isolate_snapshot_data: Some(mapping_callback(create_isolate_snapshot(
        &main_kernel(),
      ))),
      application_kernels: Some(Arc::new(move || {
        pieces
          .iter()
          .map(|piece| {
            let mapping: Arc<dyn Mapping> = Arc::new(piece.clone());
            futures::future::ready(Some(mapping)).boxed()
          })
          .collect()
      })),
      native_resolver: Some(Arc::new(self.registry.clone())),
      advisory_script_uri: ROOT_LIBRARY.to_string(),
      advisory_script_entrypoint: "main".to_string(),
      leak_vm: false,
      unhandled_exception_callback: Some(Arc::new(
        move |error: &str, _stack_trace: &str| {
          output.line(format!("unhandled: {error}"));
          true
        },
      )),
      ..Default::default()
    }
  }

  fn register_natives(&mut self) {
    let output = self.output.clone();
    self.register("main", move |_scope, args| {
      output.line(format!("main({})", args.join(",")));
      Ok(())
    });

    let output = self.output.clone();
    self.register("sayHi", move |_scope, _args| {
      output.line("hi");
      Ok(())
    });

    self.register("throwError", |_scope, _args| {
      Err(VmError::unhandled_exception("boom").with_stack_trace("#0 throwError"))
    });

    let output = self.output.clone();
    self.register("exitIsolate", move |scope, _args| {
      output.line("exiting");
      Err(scope.exit())
    });

    let output = self.output.clone();
    let slot = self.keep_alive_port.clone();
    self.register("keepAlive", move |scope, _args| {
      let handler_output = output.clone();
      let handler_slot = slot.clone();
      let port = scope.open_port(move |scope, value: Value| {
        handler_output.line(format!("received {value}"));
        if value == json!("close") {
          if let Some(port) = handler_slot.lock().take() {
            scope.close_port(port);
          }
          handler_output.line("closed");
        }
        Ok(())
      });
      *slot.lock() = Some(port);
      output.line("listening");
      Ok(())
    });

    let output = self.output.clone();
    self.register("spawnChild", move |scope, args| {
      if let Err(error) = scope.spawn("childMain", args.to_vec()) {
        output.line(format!("spawn failed: {}", error.message));
      }
      Ok(())
    });

    let output = self.output.clone();
    self.register("childMain", move |scope, args| {
      let group_root = scope.isolate().is_group_root();
      output.line(format!("child({}) root={group_root}", args.join(",")));
      Ok(())
    });

    let output = self.output.clone();
    self.register("spawnUri", move |scope, args| {
      let uri = args.first().map(String::as_str).unwrap_or("file:///other.dart");
      if let Err(error) = scope.spawn_uri(uri, vec!["spawned".to_string()]) {
        output.line(format!("spawnUri failed: {}", error.message));
      }
      Ok(())
    });

    let output = self.output.clone();
    self.register("loadDeferred", move |scope, args| {
      let loading_unit_id = args
        .first()
        .and_then(|id| id.parse::<i64>().ok())
        .unwrap_or(1);
      let completer_output = output.clone();
      let requested = scope.load_loading_unit(loading_unit_id, move |_scope, result| {
        match result {
          Ok(()) => completer_output.line(format!("loaded {loading_unit_id}")),
          Err(error) => completer_output
            .line(format!("load of {loading_unit_id} failed: {error}")),
        }
        Ok(())
      });
      if let Err(error) = requested {
        output.line(format!("request failed: {}", error.message));
      }
      Ok(())
    });

    let output = self.output.clone();
    self.register("whoAmI", move |_scope, _args| {
      match Isolate::current() {
        Some(isolate) => output.line(format!(
          "root={} platform={}",
          isolate.is_root_isolate(),
          isolate.is_platform_isolate()
        )),
        None => output.line("no isolate"),
      }
      Ok(())
    });
  }
}

fn mapping_callback(bytes: Vec<u8>) -> MappingCallback {
  let mapping: Arc<dyn Mapping> = Arc::new(bytes);
  Arc::new(move || Some(mapping.clone()))
}

/// Records deferred load requests and, optionally, takes unhandled
/// exceptions before the settings' callback sees them.
pub struct TestPlatformConfiguration {
  output: Output,
  manager: Arc<PlatformIsolateManager>,
  handles_errors: bool,
}

impl TestPlatformConfiguration {
  pub fn new(output: Output, handles_errors: bool) -> Arc<Self> {
    Arc::new(Self {
      output,
      manager: Arc::new(PlatformIsolateManager::new()),
      handles_errors,
    })
  }
}

impl PlatformConfiguration for TestPlatformConfiguration {
  fn request_deferred_library(&self, loading_unit_id: i64) {
    self.output.line(format!("requested {loading_unit_id}"));
  }

  fn platform_isolate_manager(&self) -> Arc<PlatformIsolateManager> {
    self.manager.clone()
  }

  fn on_error(&self, error: &str, _stack_trace: &str) -> bool {
    if self.handles_errors {
      self.output.line(format!("platform error: {error}"));
    }
    self.handles_errors
  }
}
