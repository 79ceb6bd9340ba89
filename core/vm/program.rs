// Copyright 2018-2025 the Deno authors. MIT license.

use super::NativeScope;
use super::blob;
use super::blob::SnapshotKind;
use super::is_precompiled_runtime;
use super::isolate::DeferredLoadHandler;
use super::isolate::current_or_error;
use super::isolate::set_fatal_error;
use super::kernel::KernelLibrary;
use super::kernel::KernelProgram;
use super::message::Message;
use super::message::drain_microtasks;
use super::message::enqueue;
use super::native::LoadingUnitCompleter;
use super::native::NativeFunction;
use super::native::NativeResolver;
use super::VmIsolate;
use crate::error::VmError;
use std::collections::HashMap;
use std::sync::Arc;

pub use super::kernel::is_kernel;

/// Resolves an import of a library to the URI of the library it names.
/// Called with the importing library's URI and the import as written.
pub type LibraryTagHandler =
  Arc<dyn Fn(&str, &str) -> Result<String, VmError> + Send + Sync>;

/// A handle to a loaded library.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Library {
  uri: String,
}

impl Library {
  pub fn uri(&self) -> &str {
    &self.uri
  }
}

/// The code loaded into an isolate group.
#[derive(Default)]
pub(crate) struct Program {
  libraries: HashMap<String, KernelLibrary>,
  root_library: Option<Library>,
  unfinalized: Vec<String>,
  native_resolver: Option<Arc<dyn NativeResolver>>,
  library_tag_handler: Option<LibraryTagHandler>,
}

impl Program {
  /// Adds the libraries of `kernel`, returning its root library. Libraries
  /// that are already loaded gain any functions they did not have.
  pub(crate) fn add(&mut self, kernel: KernelProgram) -> Result<Library, VmError> {
    let root = kernel.root_library.clone();
    if !kernel.libraries.iter().any(|library| library.uri == root)
      && !self.libraries.contains_key(&root)
    {
      return Err(VmError::compilation(format!(
        "Program does not contain its root library {root}"
      )));
    }
    for library in kernel.libraries {
      self.unfinalized.push(library.uri.clone());
      match self.libraries.get_mut(&library.uri) {
        Some(existing) => {
          for import in library.imports {
            if !existing.imports.contains(&import) {
              existing.imports.push(import);
            }
          }
          for (name, symbol) in library.functions {
            existing.functions.entry(name).or_insert(symbol);
          }
        }
        None => {
          self.libraries.insert(library.uri.clone(), library);
        }
      }
    }
    Ok(Library { uri: root })
  }

  pub(crate) fn set_root_library(&mut self, library: Option<Library>) {
    self.root_library = library;
  }

  pub(crate) fn root_library(&self) -> Option<&Library> {
    self.root_library.as_ref()
  }

  fn library(&self, uri: &str) -> Result<&KernelLibrary, VmError> {
    self
      .libraries
      .get(uri)
      .ok_or_else(|| VmError::api(format!("Library {uri} is not loaded")))
  }

  fn resolve_native(&self, symbol: &str) -> Option<NativeFunction> {
    self
      .native_resolver
      .as_ref()
      .and_then(|resolver| resolver.resolve(symbol))
  }

  fn resolve_import(&self, library: &str, import: &str) -> Result<String, VmError> {
    match &self.library_tag_handler {
      Some(handler) => handler(library, import),
      None => Ok(import.to_string()),
    }
  }

  /// Checks that every library loaded since the last call has its imports
  /// and natives available.
  pub(crate) fn finalize(&mut self) -> Result<(), VmError> {
    for uri in &self.unfinalized {
      let library = self.library(uri)?;
      for import in &library.imports {
        if import.starts_with("dart:") {
          continue;
        }
        let resolved = self.resolve_import(uri, import)?;
        if !self.libraries.contains_key(&resolved) {
          return Err(VmError::compilation(format!(
            "{uri}: import {import} could not be resolved"
          )));
        }
      }
      for (name, symbol) in &library.functions {
        if self.resolve_native(symbol).is_none() {
          return Err(VmError::compilation(format!(
            "{uri}: native {symbol} of {name} could not be resolved"
          )));
        }
      }
    }
    self.unfinalized.clear();
    Ok(())
  }

  pub(crate) fn lookup_function(
    &self,
    library: &Library,
    name: &str,
  ) -> Result<NativeFunction, VmError> {
    let symbol = self
      .library(&library.uri)?
      .functions
      .get(name)
      .ok_or_else(|| {
        VmError::api(format!("Function {name} not found in {}", library.uri))
      })?;
    self.resolve_native(symbol).ok_or_else(|| {
      VmError::compilation(format!("Native {symbol} could not be resolved"))
    })
  }
}

fn with_program<R>(
  f: impl FnOnce(&mut Program) -> Result<R, VmError>,
) -> Result<R, VmError> {
  let isolate = current_or_error()?;
  let mut program = isolate.0.group.program.lock();
  f(&mut program)
}

/// Loads a kernel program into the current isolate's group.
pub fn load_library_from_kernel(bytes: &[u8]) -> Result<Library, VmError> {
  if is_precompiled_runtime() {
    return Err(VmError::api(
      "Kernel cannot be loaded by a precompiled runtime",
    ));
  }
  let kernel = KernelProgram::from_bytes(bytes)?;
  with_program(|program| program.add(kernel))
}

pub fn set_root_library(library: Option<&Library>) -> Result<(), VmError> {
  with_program(|program| {
    if let Some(library) = library {
      program.library(&library.uri)?;
    }
    program.set_root_library(library.cloned());
    Ok(())
  })
}

pub fn root_library() -> Option<Library> {
  with_program(|program| Ok(program.root_library.clone()))
    .ok()
    .flatten()
}

pub fn lookup_library(uri: &str) -> Result<Library, VmError> {
  with_program(|program| {
    program.library(uri)?;
    Ok(Library {
      uri: uri.to_string(),
    })
  })
}

pub fn lookup_function(
  library: &Library,
  name: &str,
) -> Result<NativeFunction, VmError> {
  with_program(|program| program.lookup_function(library, name))
}

pub fn finalize_loading() -> Result<(), VmError> {
  with_program(Program::finalize)
}

pub fn set_native_resolver(
  resolver: Option<Arc<dyn NativeResolver>>,
) -> Result<(), VmError> {
  with_program(|program| {
    program.native_resolver = resolver;
    Ok(())
  })
}

pub fn set_library_tag_handler(
  handler: Option<LibraryTagHandler>,
) -> Result<(), VmError> {
  with_program(|program| {
    program.library_tag_handler = handler;
    Ok(())
  })
}

/// Schedules `function` of `library` as the first message of the current
/// isolate. It runs once the isolate is runnable and not paused on start.
pub fn start_main_isolate(
  library: &Library,
  function: &str,
  args: Vec<String>,
) -> Result<(), VmError> {
  let isolate = current_or_error()?;
  let function = lookup_function(library, function)?;
  if !isolate.is_runnable() {
    return Err(VmError::api("Isolate is not runnable"));
  }
  if !enqueue(&isolate, Message::Entrypoint { function, args }) {
    return Err(VmError::api("Isolate is shutting down"));
  }
  Ok(())
}

/// Calls `function` of `library` synchronously in the current isolate.
pub fn invoke(
  library: &Library,
  function: &str,
  args: &[String],
) -> Result<(), VmError> {
  let native = lookup_function(library, function)?;
  invoke_native(|scope| native(scope, args))
}

/// Runs `f` in the current isolate, followed by the microtasks it
/// scheduled.
pub fn invoke_native(
  f: impl FnOnce(&mut NativeScope) -> Result<(), VmError>,
) -> Result<(), VmError> {
  let isolate = current_or_error()?;
  let mut scope = NativeScope::new(isolate.clone());
  let result = f(&mut scope).and_then(|_| drain_microtasks(&isolate));
  if let Err(error) = &result {
    set_fatal_error(&isolate, error);
  }
  result
}

pub fn set_deferred_load_handler(handler: Option<DeferredLoadHandler>) {
  if let Some(isolate) = super::current_isolate() {
    isolate.0.state.lock().deferred_load_handler = handler;
  }
}

pub(crate) fn request_loading_unit(
  isolate: &VmIsolate,
  loading_unit_id: i64,
  completer: LoadingUnitCompleter,
) -> Result<(), VmError> {
  let handler = {
    let mut state = isolate.0.state.lock();
    if state.failed_loading_units.contains(&loading_unit_id) {
      return Err(VmError::api(format!(
        "Loading unit {loading_unit_id} failed permanently"
      )));
    }
    if state.pending_loading_units.contains_key(&loading_unit_id) {
      return Err(VmError::api(format!(
        "Loading unit {loading_unit_id} is already being loaded"
      )));
    }
    let handler = state
      .deferred_load_handler
      .clone()
      .ok_or_else(|| VmError::api("No deferred load handler is set"))?;
    state
      .pending_loading_units
      .insert(loading_unit_id, completer);
    handler
  };
  handler(loading_unit_id).inspect_err(|_| {
    isolate
      .0
      .state
      .lock()
      .pending_loading_units
      .remove(&loading_unit_id);
  })
}

fn complete_loading_unit(
  isolate: &VmIsolate,
  loading_unit_id: i64,
  completer: LoadingUnitCompleter,
  result: Result<(), String>,
) -> Result<(), VmError> {
  super::message::schedule_microtask(
    isolate,
    Box::new(move |scope| completer(scope, result)),
  );
  log::debug!("Completed loading unit {loading_unit_id}");
  drain_microtasks(isolate).inspect_err(|error| set_fatal_error(isolate, error))
}

/// Completes a pending deferred load with the loading unit's snapshot.
pub fn deferred_load_complete(
  loading_unit_id: i64,
  snapshot_data: &[u8],
  snapshot_instructions: &[u8],
) -> Result<(), VmError> {
  let isolate = current_or_error()?;
  if !isolate
    .0
    .state
    .lock()
    .pending_loading_units
    .contains_key(&loading_unit_id)
  {
    return Err(VmError::api(format!(
      "Loading unit {loading_unit_id} was not requested"
    )));
  }
  let (kind, payload) = blob::decode_snapshot(snapshot_data)?;
  if kind != SnapshotKind::LoadingUnit {
    return Err(VmError::api("Snapshot is not a loading unit snapshot"));
  }
  if is_precompiled_runtime() && snapshot_instructions.is_empty() {
    return Err(VmError::api("Loading unit has no instructions"));
  }
  let kernel = KernelProgram::from_manifest(payload)?;
  {
    let mut program = isolate.0.group.program.lock();
    program.add(kernel)?;
    program.finalize()?;
  }
  let completer = isolate
    .0
    .state
    .lock()
    .pending_loading_units
    .remove(&loading_unit_id);
  match completer {
    Some(completer) => {
      complete_loading_unit(&isolate, loading_unit_id, completer, Ok(()))
    }
    None => Ok(()),
  }
}

/// Fails a pending deferred load. A transient failure may be retried by
/// requesting the unit again.
pub fn deferred_load_complete_error(
  loading_unit_id: i64,
  error_message: &str,
  transient: bool,
) -> Result<(), VmError> {
  let isolate = current_or_error()?;
  let completer = {
    let mut state = isolate.0.state.lock();
    let completer = state
      .pending_loading_units
      .remove(&loading_unit_id)
      .ok_or_else(|| {
        VmError::api(format!("Loading unit {loading_unit_id} was not requested"))
      })?;
    if !transient {
      state.failed_loading_units.insert(loading_unit_id);
    }
    completer
  };
  complete_loading_unit(
    &isolate,
    loading_unit_id,
    completer,
    Err(error_message.to_string()),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vm::NativeRegistry;
  use pretty_assertions::assert_eq;

  fn resolver() -> Arc<dyn NativeResolver> {
    let mut natives = NativeRegistry::new();
    natives
      .register("main_native", |_, _| Ok(()))
      .register("helper_native", |_, _| Ok(()));
    Arc::new(natives)
  }

  #[test]
  fn finalize_reports_unresolved_imports() {
    let mut program = Program::default();
    program.native_resolver = Some(resolver());
    let kernel = KernelProgram::new("file:///main.dart")
      .function("main", "main_native")
      .import("file:///main.dart", "dart:core")
      .import("file:///main.dart", "file:///util.dart");
    program.add(kernel).unwrap();
    let err = program.finalize().unwrap_err();
    assert_eq!(err.kind, crate::error::VmErrorKind::Compilation);

    let util = KernelProgram::new("file:///util.dart")
      .function("helper", "helper_native");
    program.add(util).unwrap();
    program.finalize().unwrap();
  }

  #[test]
  fn finalize_reports_unresolved_natives() {
    let mut program = Program::default();
    program.native_resolver = Some(resolver());
    program
      .add(KernelProgram::new("file:///main.dart").function("main", "missing"))
      .unwrap();
    assert!(program.finalize().is_err());
  }

  #[test]
  fn lookup_function() {
    let mut program = Program::default();
    let root = program
      .add(KernelProgram::new("file:///main.dart").function("main", "main_native"))
      .unwrap();
    assert_eq!(root.uri(), "file:///main.dart");
    // Without a resolver nothing is callable.
    assert!(program.lookup_function(&root, "main").is_err());
    program.native_resolver = Some(resolver());
    assert!(program.lookup_function(&root, "main").is_ok());
    let err = program.lookup_function(&root, "other").err().unwrap();
    assert_eq!(err.kind, crate::error::VmErrorKind::Api);
  }

  #[test]
  fn missing_root_library_is_rejected() {
    let mut program = Program::default();
    let kernel = KernelProgram {
      root_library: "file:///main.dart".to_string(),
      libraries: vec![],
    };
    assert!(program.add(kernel).is_err());
  }

  #[test]
  fn library_tag_handler_resolves_imports() {
    let mut program = Program::default();
    program.native_resolver = Some(resolver());
    program.library_tag_handler = Some(Arc::new(|_, import| {
      Ok(format!("file:///{import}"))
    }));
    program
      .add(
        KernelProgram::new("file:///main.dart")
          .import("file:///main.dart", "util.dart")
          .library_function("file:///util.dart", "helper", "helper_native"),
      )
      .unwrap();
    program.finalize().unwrap();
  }
}
