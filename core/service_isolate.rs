// Copyright 2018-2025 the Deno authors. MIT license.

use crate::isolate::Isolate;
use crate::isolate::IsolateContext;
use crate::isolate::RootIsolateSetup;
use crate::runtime::VmRef;
use crate::tasks::TaskRunners;
use crate::vm;
use crate::vm::CreateGroupRequest;
use crate::vm::IsolateScope;
use crate::vm::VmIsolate;
use parking_lot::Mutex;
use std::net::TcpListener;
use std::sync::Arc;

const AUTH_CODE_LEN: usize = 11;
const SERVICE_TASK_RUNNER_LABEL: &str = "io.isolate_host.vm-service";

/// Receives the service URI whenever it changes. An empty URI means the
/// service stopped.
pub type ServerStatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct ServerState {
  listener: Option<TcpListener>,
  uri: String,
  callbacks: Vec<(u64, ServerStatusCallback)>,
  next_callback_id: u64,
}

static SERVER: Mutex<ServerState> = parking_lot::const_mutex(ServerState {
  listener: None,
  uri: String::new(),
  callbacks: Vec::new(),
  next_callback_id: 1,
});

/// Options the service is started with, taken from the VM's settings.
#[derive(Clone, Debug)]
pub struct ServiceOptions {
  pub host: String,
  pub port: u16,
  pub disable_auth_codes: bool,
  pub enable_port_fallback: bool,
}

/// The VM's diagnostic service.
pub struct ServiceIsolate;

impl ServiceIsolate {
  /// Binds the service, makes the current service isolate runnable and
  /// announces the URI.
  pub(crate) fn startup(options: &ServiceOptions) -> Result<String, String> {
    let Some(vm_isolate) = vm::current_isolate() else {
      return Err("The service isolate must be current to start".to_string());
    };
    let listener = bind(options)?;
    let address = listener
      .local_addr()
      .map_err(|error| format!("Could not read the VM service address: {error}"))?;
    let mut uri = format!("http://{address}/");
    if !options.disable_auth_codes {
      uri.push_str(&auth_code());
      uri.push('/');
    }

    vm::exit_isolate();
    let runnable = vm::isolate_make_runnable(&vm_isolate);
    vm::enter_isolate(&vm_isolate);
    runnable?;

    log::info!("The VM service is listening on {uri}");
    let callbacks = {
      let mut server = SERVER.lock();
      server.listener = Some(listener);
      server.uri = uri.clone();
      server.callbacks.clone()
    };
    for (_, callback) in callbacks {
      callback(&uri);
    }
    Ok(uri)
  }

  /// Stops listening and tells status callbacks.
  pub fn shutdown() {
    let callbacks = {
      let mut server = SERVER.lock();
      if server.listener.take().is_none() && server.uri.is_empty() {
        return;
      }
      server.uri.clear();
      server.callbacks.clone()
    };
    log::debug!("The VM service stopped");
    for (_, callback) in callbacks {
      callback("");
    }
  }

  /// The URI the service is reachable at, if it is running.
  pub fn server_uri() -> Option<String> {
    let server = SERVER.lock();
    (!server.uri.is_empty()).then(|| server.uri.clone())
  }

  /// Registers `callback`. If the service is already running it is told
  /// the current URI right away.
  pub fn add_server_status_callback(callback: ServerStatusCallback) -> u64 {
    let (id, uri) = {
      let mut server = SERVER.lock();
      let id = server.next_callback_id;
      server.next_callback_id += 1;
      server.callbacks.push((id, callback.clone()));
      (id, server.uri.clone())
    };
    if !uri.is_empty() {
      callback(&uri);
    }
    id
  }

  pub fn remove_server_status_callback(id: u64) -> bool {
    let mut server = SERVER.lock();
    let before = server.callbacks.len();
    server.callbacks.retain(|(callback_id, _)| *callback_id != id);
    server.callbacks.len() != before
  }
}

fn bind(options: &ServiceOptions) -> Result<TcpListener, String> {
  let host = options.host.as_str();
  match TcpListener::bind((host, options.port)) {
    Ok(listener) => Ok(listener),
    Err(error) if options.enable_port_fallback && options.port != 0 => {
      log::warn!(
        "Could not bind the VM service to {host}:{} ({error}), using a free port",
        options.port
      );
      TcpListener::bind((host, 0))
        .map_err(|error| format!("Could not bind the VM service to {host}: {error}"))
    }
    Err(error) => Err(format!(
      "Could not bind the VM service to {host}:{}: {error}",
      options.port
    )),
  }
}

fn auth_code() -> String {
  std::iter::repeat_with(fastrand::alphanumeric)
    .take(AUTH_CODE_LEN)
    .collect()
}

/// Group-create path for the reserved service isolate name. Declines when
/// the settings do not enable the service.
pub(crate) fn create_and_start_service_isolate(
  request: CreateGroupRequest,
) -> Result<Option<VmIsolate>, String> {
  let Some(vm_data) = VmRef::get_vm_data() else {
    return Err(
      "Could not access VM data to initialize isolates. This may be because the VM has initialized shutdown on another thread already."
        .to_string(),
    );
  };
  let settings = vm_data.settings();
  if !settings.enable_vm_service {
    return Ok(None);
  }

  let mut flags = request.flags;
  flags.load_vmservice_library = true;
  let context = IsolateContext {
    task_runners: TaskRunners {
      label: SERVICE_TASK_RUNNER_LABEL.to_string(),
      ..Default::default()
    },
    advisory_script_uri: vm::SERVICE_ISOLATE_NAME.to_string(),
    advisory_script_entrypoint: vm::SERVICE_ISOLATE_NAME.to_string(),
  };
  let weak = Isolate::create_root_isolate(RootIsolateSetup {
    settings,
    isolate_snapshot: vm_data.service_isolate_snapshot().clone(),
    platform_configuration: None,
    flags,
    isolate_create_callback: None,
    isolate_shutdown_callback: None,
    context,
    spawning_isolate: None,
    native_assets_manager: None,
  })
  .map_err(|error| {
    log::error!("Could not create the service isolate: {error}");
    error.to_string()
  })?;
  let Some(vm_isolate) = weak
    .upgrade()
    .and_then(|isolate| isolate.vm_isolate().cloned())
  else {
    return Err("The service isolate went away during startup".to_string());
  };

  {
    let _scope = IsolateScope::new(&vm_isolate);
    let options = ServiceOptions {
      host: settings.vm_service_host.clone(),
      port: settings.vm_service_port,
      disable_auth_codes: settings.disable_service_auth_codes,
      enable_port_fallback: settings.enable_service_port_fallback,
    };
    if let Err(error) = ServiceIsolate::startup(&options) {
      log::error!("Could not start the VM service: {error}");
      vm::shutdown_isolate();
      return Err(error);
    }
    if let Some(isolate) = weak.upgrade() {
      isolate.add_isolate_shutdown_callback(ServiceIsolate::shutdown);
    }
  }

  if let Some(callback) = &settings.service_isolate_create_callback {
    callback();
  }
  match VmRef::get_service_protocol() {
    Some(service_protocol) => service_protocol.toggle_hooks(true),
    None => log::error!(
      "Could not acquire the service protocol handlers. This might be because the VM has already begun teardown on another thread."
    ),
  }
  Ok(Some(vm_isolate))
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn auth_codes_are_alphanumeric() {
    let code = auth_code();
    assert_eq!(code.len(), AUTH_CODE_LEN);
    assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
  }

  #[test]
  fn falls_back_to_a_free_port() {
    let taken = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = taken.local_addr().unwrap().port();
    let mut options = ServiceOptions {
      host: "127.0.0.1".to_string(),
      port,
      disable_auth_codes: true,
      enable_port_fallback: false,
    };
    assert!(bind(&options).is_err());
    options.enable_port_fallback = true;
    let listener = bind(&options).unwrap();
    assert_ne!(listener.local_addr().unwrap().port(), port);
  }
}
