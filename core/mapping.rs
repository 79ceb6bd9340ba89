// Copyright 2018-2025 the Deno authors. MIT license.

use crate::error::SnapshotError;
use crate::vm::blob;
use bytes::Bytes;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// A read-only region of memory, shared freely across threads.
pub trait Mapping: Send + Sync {
  fn as_bytes(&self) -> &[u8];

  fn len(&self) -> usize {
    self.as_bytes().len()
  }

  fn is_empty(&self) -> bool {
    self.as_bytes().is_empty()
  }

  /// Whether the pages backing this mapping may be discarded and faulted
  /// back in from their source.
  fn is_dont_need_safe(&self) -> bool {
    false
  }
}

impl std::fmt::Debug for dyn Mapping {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Mapping").field("len", &self.len()).finish()
  }
}

impl Mapping for &'static [u8] {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

impl Mapping for Vec<u8> {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

impl Mapping for Bytes {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

enum FileMappingInner {
  Read(memmap2::Mmap),
  // Zero-length files cannot be mapped.
  Empty,
}

/// A file mapped read-only, or read-execute for instruction blobs.
pub struct FileMapping {
  inner: FileMappingInner,
}

impl FileMapping {
  pub fn open(
    path: impl AsRef<Path>,
    executable: bool,
  ) -> Result<Self, SnapshotError> {
    let path = path.as_ref();
    let map_err = |source| SnapshotError::Map {
      path: path.display().to_string(),
      source,
    };
    let file = File::open(path).map_err(map_err)?;
    if file.metadata().map_err(map_err)?.len() == 0 {
      return Ok(Self {
        inner: FileMappingInner::Empty,
      });
    }
    // SAFETY: snapshot files are treated as immutable for the lifetime of the
    // process; the mapping is private and read-only.
    let mmap = if executable {
      unsafe { memmap2::MmapOptions::new().map_exec(&file) }
    } else {
      unsafe { memmap2::Mmap::map(&file) }
    }
    .map_err(map_err)?;
    Ok(Self {
      inner: FileMappingInner::Read(mmap),
    })
  }
}

impl Mapping for FileMapping {
  fn as_bytes(&self) -> &[u8] {
    match &self.inner {
      FileMappingInner::Read(mmap) => mmap,
      FileMappingInner::Empty => &[],
    }
  }

  fn is_dont_need_safe(&self) -> bool {
    matches!(self.inner, FileMappingInner::Read(_))
  }
}

/// A snapshot blob exported as a data symbol from a dynamic library, or from
/// the running executable.
pub struct SymbolMapping {
  _library: Arc<libloading::Library>,
  ptr: *const u8,
  len: usize,
}

// SAFETY: the symbol points at immutable data that lives as long as the
// library handle held alongside it.
unsafe impl Send for SymbolMapping {}
// SAFETY: see above.
unsafe impl Sync for SymbolMapping {}

impl SymbolMapping {
  pub fn new(
    library: Arc<libloading::Library>,
    symbol: &str,
  ) -> Result<Self, SnapshotError> {
    // SAFETY: the symbol is only read through as a byte blob whose length is
    // checked against the header before the rest is touched.
    let ptr = unsafe {
      let symbol = library
        .get::<*const u8>(symbol.as_bytes())
        .map_err(|_| SnapshotError::Symbol(symbol.to_string()))?;
      *symbol
    };
    if ptr.is_null() {
      return Err(SnapshotError::Symbol(symbol.to_string()));
    }
    // SAFETY: every exported snapshot symbol starts with a full header.
    let header = unsafe { std::slice::from_raw_parts(ptr, blob::HEADER_LEN) };
    let len = blob::blob_len(header)
      .ok_or_else(|| SnapshotError::Symbol(symbol.to_string()))?;
    Ok(Self {
      _library: library,
      ptr,
      len,
    })
  }

  pub fn open_library(path: &str) -> Result<Arc<libloading::Library>, SnapshotError> {
    // SAFETY: snapshot libraries carry data only; their initializers are
    // trusted the same way the executable's are.
    let library = unsafe { libloading::Library::new(path) }.map_err(|source| {
      SnapshotError::Library {
        path: path.to_string(),
        source,
      }
    })?;
    Ok(Arc::new(library))
  }

  /// A handle to the image of the running process.
  pub fn process_library() -> Result<Arc<libloading::Library>, SnapshotError> {
    #[cfg(unix)]
    let library: libloading::Library =
      libloading::os::unix::Library::this().into();
    #[cfg(windows)]
    let library: libloading::Library = libloading::os::windows::Library::this()
      .map_err(|source| SnapshotError::Library {
        path: "<process>".to_string(),
        source,
      })?
      .into();
    Ok(Arc::new(library))
  }
}

impl Mapping for SymbolMapping {
  fn as_bytes(&self) -> &[u8] {
    // SAFETY: `ptr..ptr + len` was validated against the blob header.
    unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn file_mapping_reads_contents() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"snapshot bytes").unwrap();
    let mapping = FileMapping::open(file.path(), false).unwrap();
    assert_eq!(mapping.as_bytes(), b"snapshot bytes");
    assert!(mapping.is_dont_need_safe());
  }

  #[test]
  fn executable_mapping_reads_contents() {
    // Kept beside the crate; temp directories may be mounted noexec.
    let mut file = tempfile::Builder::new()
      .tempfile_in(env!("CARGO_MANIFEST_DIR"))
      .unwrap();
    file.write_all(b"instructions").unwrap();
    let mapping = FileMapping::open(file.path(), true).unwrap();
    assert_eq!(mapping.as_bytes(), b"instructions");
    assert!(mapping.is_dont_need_safe());
  }

  #[test]
  fn empty_file_maps_to_empty_slice() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mapping = FileMapping::open(file.path(), false).unwrap();
    assert!(mapping.is_empty());
    assert!(!mapping.is_dont_need_safe());
  }

  #[test]
  fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = FileMapping::open(dir.path().join("missing.bin"), false);
    assert!(matches!(result, Err(SnapshotError::Map { .. })));
  }

  #[test]
  fn missing_process_symbol_is_an_error() {
    let library = SymbolMapping::process_library().unwrap();
    let result = SymbolMapping::new(library, "isolate_host_no_such_symbol");
    assert!(matches!(result, Err(SnapshotError::Symbol(_))));
  }
}
