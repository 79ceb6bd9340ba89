// Copyright 2018-2025 the Deno authors. MIT license.

//! Kernel program format: [`KERNEL_MAGIC`] followed by a JSON manifest of
//! libraries. Functions name the native symbol that implements them.

use crate::error::VmError;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

pub const KERNEL_MAGIC: [u8; 4] = *b"IHKB";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelLibrary {
  pub uri: String,
  #[serde(default)]
  pub imports: Vec<String>,
  /// Function name to native symbol.
  #[serde(default)]
  pub functions: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelProgram {
  /// The library the program's entrypoints are looked up in.
  pub root_library: String,
  pub libraries: Vec<KernelLibrary>,
}

impl KernelProgram {
  pub fn new(root_library: impl Into<String>) -> Self {
    let root_library = root_library.into();
    Self {
      libraries: vec![KernelLibrary {
        uri: root_library.clone(),
        ..Default::default()
      }],
      root_library,
    }
  }

  /// Adds a function to the root library.
  pub fn function(
    mut self,
    name: impl Into<String>,
    native_symbol: impl Into<String>,
  ) -> Self {
    let root = self.root_library.clone();
    self
      .library_mut(&root)
      .functions
      .insert(name.into(), native_symbol.into());
    self
  }

  /// Adds a function to `library`, creating the library if needed.
  pub fn library_function(
    mut self,
    library: &str,
    name: impl Into<String>,
    native_symbol: impl Into<String>,
  ) -> Self {
    self
      .library_mut(library)
      .functions
      .insert(name.into(), native_symbol.into());
    self
  }

  pub fn import(mut self, library: &str, import: impl Into<String>) -> Self {
    self.library_mut(library).imports.push(import.into());
    self
  }

  fn library_mut(&mut self, uri: &str) -> &mut KernelLibrary {
    let index = match self.libraries.iter().position(|l| l.uri == uri) {
      Some(index) => index,
      None => {
        self.libraries.push(KernelLibrary {
          uri: uri.to_string(),
          ..Default::default()
        });
        self.libraries.len() - 1
      }
    };
    &mut self.libraries[index]
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    let mut out = KERNEL_MAGIC.to_vec();
    // Serializing plain strings and maps cannot fail.
    serde_json::to_writer(&mut out, self).unwrap_or_default();
    out
  }

  /// Parses a JSON manifest without the kernel magic, as embedded in
  /// precompiled snapshots and loading units.
  pub fn from_manifest(manifest: &[u8]) -> Result<Self, VmError> {
    serde_json::from_slice(manifest)
      .map_err(|err| VmError::compilation(format!("Invalid program: {err}")))
  }

  pub fn to_manifest(&self) -> Vec<u8> {
    serde_json::to_vec(self).unwrap_or_default()
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmError> {
    if !is_kernel(bytes) {
      return Err(VmError::api("Not a kernel blob"));
    }
    Self::from_manifest(&bytes[KERNEL_MAGIC.len()..])
  }
}

pub fn is_kernel(bytes: &[u8]) -> bool {
  bytes.starts_with(&KERNEL_MAGIC)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn builder_places_functions_in_libraries() {
    let program = KernelProgram::new("file:///main.dart")
      .function("main", "main_native")
      .library_function("file:///util.dart", "helper", "helper_native")
      .import("file:///main.dart", "util.dart");
    assert_eq!(program.libraries.len(), 2);
    assert_eq!(program.libraries[0].imports, vec!["util.dart".to_string()]);
    assert_eq!(
      program.libraries[1].functions.get("helper").map(String::as_str),
      Some("helper_native")
    );
    let decoded = KernelProgram::from_bytes(&program.to_bytes()).unwrap();
    assert_eq!(decoded, program);
  }

  #[test]
  fn garbage_is_not_kernel() {
    assert!(!is_kernel(b"garbage"));
    assert!(KernelProgram::from_bytes(b"garbage").is_err());
    let mut corrupt = KERNEL_MAGIC.to_vec();
    corrupt.extend_from_slice(b"{not json");
    let err = KernelProgram::from_bytes(&corrupt).unwrap_err();
    assert_eq!(err.kind, crate::error::VmErrorKind::Compilation);
  }
}
