// Copyright 2018-2025 the Deno authors. MIT license.

use crate::mapping::FileMapping;
use crate::mapping::Mapping;
use crate::mapping::SymbolMapping;
use crate::settings::MappingCallback;
use crate::settings::Settings;
use std::sync::Arc;

pub const VM_DATA_SYMBOL: &str = "isolate_host_vm_snapshot_data";
pub const VM_INSTRUCTIONS_SYMBOL: &str = "isolate_host_vm_snapshot_instructions";
pub const ISOLATE_DATA_SYMBOL: &str = "isolate_host_isolate_snapshot_data";
pub const ISOLATE_INSTRUCTIONS_SYMBOL: &str =
  "isolate_host_isolate_snapshot_instructions";

/// Finds a mapping by trying, in order: the embedder callback, a file path,
/// `symbol` in each of `library_search_paths`, and `symbol` in the running
/// process. The first hit wins.
pub fn search_mapping(
  embedder_callback: Option<&MappingCallback>,
  file_path: &str,
  library_search_paths: &[String],
  symbol: &str,
  executable: bool,
) -> Option<Arc<dyn Mapping>> {
  if let Some(callback) = embedder_callback {
    if let Some(mapping) = callback() {
      return Some(mapping);
    }
  }

  if !file_path.is_empty() {
    match FileMapping::open(file_path, executable) {
      Ok(mapping) => return Some(Arc::new(mapping)),
      Err(err) => log::debug!("{err}"),
    }
  }

  for path in library_search_paths {
    let mapping = SymbolMapping::open_library(path)
      .and_then(|library| SymbolMapping::new(library, symbol));
    match mapping {
      Ok(mapping) => return Some(Arc::new(mapping)),
      Err(err) => log::debug!("{err}"),
    }
  }

  let mapping = SymbolMapping::process_library()
    .and_then(|library| SymbolMapping::new(library, symbol));
  match mapping {
    Ok(mapping) => Some(Arc::new(mapping)),
    Err(err) => {
      log::debug!("{err}");
      None
    }
  }
}

/// An immutable heap image plus optional machine code for it.
pub struct Snapshot {
  data: Option<Arc<dyn Mapping>>,
  instructions: Option<Arc<dyn Mapping>>,
}

impl Snapshot {
  pub fn new(
    data: Option<Arc<dyn Mapping>>,
    instructions: Option<Arc<dyn Mapping>>,
  ) -> Arc<Self> {
    Arc::new(Self { data, instructions })
  }

  pub fn vm_snapshot_from_settings(settings: &Settings) -> Option<Arc<Self>> {
    let snapshot = Self::new(
      search_mapping(
        settings.vm_snapshot_data.as_ref(),
        &settings.vm_snapshot_data_path,
        &settings.application_library_path,
        VM_DATA_SYMBOL,
        false,
      ),
      search_mapping(
        settings.vm_snapshot_instr.as_ref(),
        &settings.vm_snapshot_instr_path,
        &settings.application_library_path,
        VM_INSTRUCTIONS_SYMBOL,
        true,
      ),
    );
    snapshot.is_valid().then_some(snapshot)
  }

  pub fn isolate_snapshot_from_settings(
    settings: &Settings,
  ) -> Option<Arc<Self>> {
    let snapshot = Self::new(
      search_mapping(
        settings.isolate_snapshot_data.as_ref(),
        &settings.isolate_snapshot_data_path,
        &settings.application_library_path,
        ISOLATE_DATA_SYMBOL,
        false,
      ),
      search_mapping(
        settings.isolate_snapshot_instr.as_ref(),
        &settings.isolate_snapshot_instr_path,
        &settings.application_library_path,
        ISOLATE_INSTRUCTIONS_SYMBOL,
        true,
      ),
    );
    snapshot.is_valid().then_some(snapshot)
  }

  /// The service isolate only gets its own snapshot when precompiled
  /// libraries for it were configured.
  pub fn vm_service_isolate_snapshot_from_settings(
    settings: &Settings,
  ) -> Option<Arc<Self>> {
    if !crate::vm::is_precompiled_runtime()
      || settings.vmservice_snapshot_library_path.is_empty()
    {
      return None;
    }
    let snapshot = Self::new(
      search_mapping(
        None,
        "",
        &settings.vmservice_snapshot_library_path,
        ISOLATE_DATA_SYMBOL,
        false,
      ),
      search_mapping(
        None,
        "",
        &settings.vmservice_snapshot_library_path,
        ISOLATE_INSTRUCTIONS_SYMBOL,
        true,
      ),
    );
    snapshot.is_valid().then_some(snapshot)
  }

  pub fn isolate_snapshot_from_mappings(
    data: Option<Arc<dyn Mapping>>,
    instructions: Option<Arc<dyn Mapping>>,
  ) -> Option<Arc<Self>> {
    let snapshot = Self::new(data, instructions);
    snapshot.is_valid().then_some(snapshot)
  }

  pub fn is_valid(&self) -> bool {
    self.data.is_some()
  }

  pub fn is_valid_for_aot(&self) -> bool {
    self.data.is_some() && self.instructions.is_some()
  }

  pub fn is_dont_need_safe(&self) -> bool {
    if self.data.as_ref().is_some_and(|d| !d.is_dont_need_safe()) {
      return false;
    }
    if self
      .instructions
      .as_ref()
      .is_some_and(|i| !i.is_dont_need_safe())
    {
      return false;
    }
    true
  }

  pub fn data_mapping(&self) -> Option<&Arc<dyn Mapping>> {
    self.data.as_ref()
  }

  pub fn instructions_mapping(&self) -> Option<&Arc<dyn Mapping>> {
    self.instructions.as_ref()
  }

  pub fn data(&self) -> &[u8] {
    self.data.as_ref().map(|d| d.as_bytes()).unwrap_or_default()
  }
}

impl std::fmt::Debug for Snapshot {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Snapshot")
      .field("data", &self.data.as_ref().map(|d| d.len()))
      .field("instructions", &self.instructions.as_ref().map(|i| i.len()))
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  fn bytes(b: &'static [u8]) -> Arc<dyn Mapping> {
    Arc::new(b)
  }

  #[test]
  fn validity_predicates() {
    let empty = Snapshot::new(None, None);
    assert!(!empty.is_valid());
    assert!(!empty.is_valid_for_aot());

    let data_only = Snapshot::new(Some(bytes(b"data")), None);
    assert!(data_only.is_valid());
    assert!(!data_only.is_valid_for_aot());

    let both = Snapshot::new(Some(bytes(b"data")), Some(bytes(b"instr")));
    assert!(both.is_valid_for_aot());
    // Static byte slices cannot be paged back in.
    assert!(!both.is_dont_need_safe());
    assert!(Snapshot::new(None, None).is_dont_need_safe());
  }

  #[test]
  fn callback_wins_over_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"from file").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let callback: MappingCallback = Arc::new(move || {
      c.fetch_add(1, Ordering::SeqCst);
      Some(bytes(b"from callback"))
    });
    let mapping =
      search_mapping(Some(&callback), &path, &[], VM_DATA_SYMBOL, false)
        .unwrap();
    assert_eq!(mapping.as_bytes(), b"from callback");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn empty_callback_falls_through_to_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"from file").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let callback: MappingCallback = Arc::new(|| None);
    let mapping =
      search_mapping(Some(&callback), &path, &[], VM_DATA_SYMBOL, false)
        .unwrap();
    assert_eq!(mapping.as_bytes(), b"from file");
  }

  #[test]
  fn all_steps_failing_yields_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing").to_str().unwrap().to_string();
    let libraries = vec![dir.path().join("libmissing.so").display().to_string()];
    let mapping = search_mapping(
      None,
      &missing,
      &libraries,
      "isolate_host_no_such_symbol",
      false,
    );
    assert!(mapping.is_none());
  }

  #[test]
  fn settings_without_sources_produce_no_snapshot() {
    let settings = Settings::default();
    assert!(Snapshot::vm_snapshot_from_settings(&settings).is_none());
    assert!(Snapshot::isolate_snapshot_from_settings(&settings).is_none());
    assert!(
      Snapshot::vm_service_isolate_snapshot_from_settings(&settings).is_none()
    );
  }
}
