// Copyright 2018-2025 the Deno authors. MIT license.

use super::Isolate;
use super::Phase;
use crate::error::IsolateError;
use crate::mapping::Mapping;
use crate::settings::KernelPieceFuture;
use crate::settings::Settings;
use crate::tasks::TaskRunner;
use crate::vm;
use futures::FutureExt;
use futures::channel::oneshot;
use std::sync::Arc;

/// Decides how a root isolate gets its program: from the snapshot, or from
/// one or more kernel pieces.
pub trait IsolateConfiguration: Send {
  fn do_prepare_isolate(&mut self, isolate: &Isolate) -> Result<(), IsolateError>;

  /// Readies an isolate in [`Phase::LibrariesSetup`] for running.
  fn prepare_isolate(&mut self, isolate: &Isolate) -> Result<(), IsolateError> {
    let phase = isolate.phase();
    if phase != Phase::LibrariesSetup {
      log::error!("Isolate was in incorrect phase to be prepared for running.");
      return Err(IsolateError::WrongPhase {
        expected: Phase::LibrariesSetup,
        actual: phase,
      });
    }
    self.do_prepare_isolate(isolate)
  }
}

/// The program is part of a precompiled isolate snapshot.
#[derive(Debug, Default)]
pub struct AppSnapshotIsolateConfiguration;

impl IsolateConfiguration for AppSnapshotIsolateConfiguration {
  fn do_prepare_isolate(&mut self, isolate: &Isolate) -> Result<(), IsolateError> {
    isolate.prepare_for_running_from_precompiled_code()
  }
}

/// The program is a single kernel blob. `None` is only valid for isolates
/// that join a group which already has a program.
#[derive(Debug, Default)]
pub struct KernelIsolateConfiguration {
  kernel: Option<Arc<dyn Mapping>>,
}

impl KernelIsolateConfiguration {
  pub fn new(kernel: Option<Arc<dyn Mapping>>) -> Self {
    Self { kernel }
  }
}

impl IsolateConfiguration for KernelIsolateConfiguration {
  fn do_prepare_isolate(&mut self, isolate: &Isolate) -> Result<(), IsolateError> {
    if vm::is_precompiled_runtime() {
      return Err(IsolateError::Precompiled);
    }
    isolate.prepare_for_running_from_kernel(self.kernel.clone(), false, true)
  }
}

/// The program comes in pieces that are loaded in order, each awaited
/// before it is loaded.
pub struct KernelListIsolateConfiguration {
  kernel_pieces: Vec<KernelPieceFuture>,
}

impl KernelListIsolateConfiguration {
  pub fn new(kernel_pieces: Vec<KernelPieceFuture>) -> Self {
    Self { kernel_pieces }
  }
}

impl IsolateConfiguration for KernelListIsolateConfiguration {
  fn do_prepare_isolate(&mut self, isolate: &Isolate) -> Result<(), IsolateError> {
    if vm::is_precompiled_runtime() {
      return Err(IsolateError::Precompiled);
    }
    // The pieces can only be awaited once.
    let pieces = std::mem::take(&mut self.kernel_pieces);
    if pieces.is_empty() {
      log::error!("Kernel list was empty.");
      return Err(IsolateError::InvalidKernel);
    }
    let count = pieces.len();
    for (index, piece) in pieces.into_iter().enumerate() {
      let Some(kernel) = futures::executor::block_on(piece) else {
        log::error!("Kernel piece {index} could not be loaded.");
        return Err(IsolateError::InvalidKernel);
      };
      isolate.prepare_for_running_from_kernel(
        Some(kernel),
        false,
        index + 1 == count,
      )?;
    }
    Ok(())
  }
}

/// Whether an isolate starts a new group or joins the group of an isolate
/// it is spawned from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolateLaunchType {
  NewGroup,
  ExistingGroup,
}

/// Picks the configuration `settings` describe.
///
/// Kernel pieces are resolved on `io_worker` when one is given, so slow
/// sources are already being fetched while earlier pieces load.
pub fn infer_from_settings(
  settings: &Settings,
  io_worker: Option<Arc<dyn TaskRunner>>,
  launch_type: IsolateLaunchType,
) -> Option<Box<dyn IsolateConfiguration>> {
  if vm::is_precompiled_runtime() {
    return Some(Box::new(AppSnapshotIsolateConfiguration));
  }
  if launch_type == IsolateLaunchType::ExistingGroup {
    return Some(Box::new(KernelIsolateConfiguration::new(None)));
  }
  let Some(producer) = &settings.application_kernels else {
    log::error!("No kernel was provided and the runtime is not precompiled.");
    return None;
  };
  let pieces = producer()
    .into_iter()
    .map(|piece| match &io_worker {
      Some(worker) => resolve_on(worker, piece),
      None => piece,
    })
    .collect();
  Some(Box::new(KernelListIsolateConfiguration::new(pieces)))
}

fn resolve_on(worker: &Arc<dyn TaskRunner>, piece: KernelPieceFuture) -> KernelPieceFuture {
  let (sender, receiver) = oneshot::channel();
  worker.post_task(Box::new(move || {
    let _ = sender.send(futures::executor::block_on(piece));
  }));
  async move { receiver.await.ok().flatten() }.boxed()
}
