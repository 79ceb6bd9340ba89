// Copyright 2018-2025 the Deno authors. MIT license.

use crate::error::VmCreateError;
use crate::settings::Settings;
use crate::snapshot::Snapshot;
use std::sync::Arc;

/// The snapshots a VM was launched with, resolved once and shared with
/// every isolate created by that VM.
#[derive(Debug)]
pub struct VmData {
  settings: Settings,
  vm_snapshot: Arc<Snapshot>,
  isolate_snapshot: Arc<Snapshot>,
  service_isolate_snapshot: Option<Arc<Snapshot>>,
}

impl VmData {
  /// Uses the given snapshots when they are valid and resolves the rest
  /// from `settings`.
  pub fn create(
    settings: Settings,
    vm_snapshot: Option<Arc<Snapshot>>,
    isolate_snapshot: Option<Arc<Snapshot>>,
  ) -> Result<Arc<VmData>, VmCreateError> {
    let vm_snapshot = vm_snapshot
      .filter(|snapshot| snapshot.is_valid())
      .or_else(|| Snapshot::vm_snapshot_from_settings(&settings));
    let Some(vm_snapshot) = vm_snapshot else {
      log::error!("VM snapshot invalid and could not be inferred from settings.");
      return Err(VmCreateError::VmSnapshot);
    };

    let isolate_snapshot = isolate_snapshot
      .filter(|snapshot| snapshot.is_valid())
      .or_else(|| Snapshot::isolate_snapshot_from_settings(&settings));
    let Some(isolate_snapshot) = isolate_snapshot else {
      log::error!(
        "Isolate snapshot invalid and could not be inferred from settings."
      );
      return Err(VmCreateError::IsolateSnapshot);
    };

    let service_isolate_snapshot =
      Snapshot::vm_service_isolate_snapshot_from_settings(&settings);

    Ok(Arc::new(VmData {
      settings,
      vm_snapshot,
      isolate_snapshot,
      service_isolate_snapshot,
    }))
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn vm_snapshot(&self) -> &Arc<Snapshot> {
    &self.vm_snapshot
  }

  pub fn isolate_snapshot(&self) -> &Arc<Snapshot> {
    &self.isolate_snapshot
  }

  /// Falls back to the isolate snapshot when the service has none of its
  /// own.
  pub fn service_isolate_snapshot(&self) -> &Arc<Snapshot> {
    self
      .service_isolate_snapshot
      .as_ref()
      .unwrap_or(&self.isolate_snapshot)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mapping::Mapping;

  fn snapshot(bytes: &'static [u8]) -> Arc<Snapshot> {
    let data: Arc<dyn Mapping> = Arc::new(bytes);
    Snapshot::new(Some(data), None)
  }

  #[test]
  fn missing_snapshots_are_errors() {
    let error =
      VmData::create(Settings::default(), None, Some(snapshot(b"i"))).unwrap_err();
    assert!(matches!(error, VmCreateError::VmSnapshot));

    let error =
      VmData::create(Settings::default(), Some(snapshot(b"v")), None).unwrap_err();
    assert!(matches!(error, VmCreateError::IsolateSnapshot));

    let invalid = Snapshot::new(None, None);
    let error =
      VmData::create(Settings::default(), Some(invalid), Some(snapshot(b"i")))
        .unwrap_err();
    assert!(matches!(error, VmCreateError::VmSnapshot));
  }

  #[test]
  fn service_snapshot_falls_back_to_isolate_snapshot() {
    let isolate_snapshot = snapshot(b"isolate");
    let vm_data = VmData::create(
      Settings::default(),
      Some(snapshot(b"vm")),
      Some(isolate_snapshot.clone()),
    )
    .unwrap();
    assert!(Arc::ptr_eq(vm_data.service_isolate_snapshot(), &isolate_snapshot));
    assert_eq!(vm_data.vm_snapshot().data(), b"vm");
  }
}
