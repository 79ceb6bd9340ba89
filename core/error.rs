// Copyright 2018-2025 the Deno authors. MIT license.

use crate::isolate::Phase;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

/// A generic wrapper that can encapsulate any concrete error type.
pub type AnyError = anyhow::Error;

/// The kind of an error raised by the managed runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VmErrorKind {
  /// Misuse of the runtime API: unknown library, wrong isolate, bad handle.
  Api,
  /// A program could not be loaded or finalized.
  Compilation,
  /// Managed code threw and nothing caught it.
  UnhandledException,
  /// The isolate is being torn down. Not recoverable.
  Unwind,
}

/// An error value produced by the managed runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmError {
  pub kind: VmErrorKind,
  pub message: String,
  pub stack_trace: Option<String>,
}

impl VmError {
  pub fn new(kind: VmErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      stack_trace: None,
    }
  }

  pub fn api(message: impl Into<String>) -> Self {
    Self::new(VmErrorKind::Api, message)
  }

  pub fn compilation(message: impl Into<String>) -> Self {
    Self::new(VmErrorKind::Compilation, message)
  }

  pub fn unhandled_exception(message: impl Into<String>) -> Self {
    Self::new(VmErrorKind::UnhandledException, message)
  }

  pub fn unwind(message: impl Into<String>) -> Self {
    Self::new(VmErrorKind::Unwind, message)
  }

  pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
    self.stack_trace = Some(stack_trace.into());
    self
  }

  /// Fatal errors terminate the isolate that raised them.
  pub fn is_fatal(&self) -> bool {
    self.kind == VmErrorKind::Unwind
  }
}

impl Display for VmError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let kind = match self.kind {
      VmErrorKind::Api => "API error",
      VmErrorKind::Compilation => "Compilation error",
      VmErrorKind::UnhandledException => "Unhandled exception",
      VmErrorKind::Unwind => "Unwind error",
    };
    write!(f, "{kind}: {}", self.message)
  }
}

impl std::error::Error for VmError {}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
  #[error("Could not map {path}")]
  Map {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Could not open library {path}")]
  Library {
    path: String,
    #[source]
    source: libloading::Error,
  },
  #[error("Symbol {0} does not point to a snapshot blob")]
  Symbol(String),
}

/// Failures while bootstrapping the process-wide VM.
#[derive(Debug, thiserror::Error)]
pub enum VmCreateError {
  #[error("VM snapshot invalid and could not be inferred from settings.")]
  VmSnapshot,
  #[error("Isolate snapshot invalid and could not be inferred from settings.")]
  IsolateSnapshot,
  #[error("Could not set VM flags: {0}")]
  Flags(String),
  #[error("Could not initialize the VM: {0}")]
  Initialize(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IsolateError {
  #[error("Isolate was in the {actual:?} phase, expected {expected:?}")]
  WrongPhase { expected: Phase, actual: Phase },
  #[error("Cannot transition an isolate from {from:?} to {to:?}")]
  InvalidTransition { from: Phase, to: Phase },
  #[error("Isolate has already been shut down")]
  AlreadyShutdown,
  #[error("Invalid isolate snapshot")]
  InvalidSnapshot,
  #[error("No isolate configuration was provided")]
  MissingConfiguration,
  #[error("Could not prepare the isolate to run")]
  Prepare,
  #[error("Runtime is not configured to run precompiled code")]
  NotPrecompiled,
  #[error("Runtime is configured to run precompiled code, kernel buffers are not accepted")]
  Precompiled,
  #[error("Invalid kernel blob")]
  InvalidKernel,
  #[error("Root library was not set")]
  NoRootLibrary,
  #[error("Could not resolve the entrypoint function {0}")]
  EntrypointNotFound(String),
  #[error("Invalid loading unit {0}")]
  InvalidLoadingUnit(i64),
  #[error("Could not create isolate: {0}")]
  Create(String),
  #[error("Could not make the isolate runnable: {0}")]
  MakeRunnable(String),
  #[error(transparent)]
  Vm(#[from] VmError),
}
