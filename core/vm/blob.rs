// Copyright 2018-2025 the Deno authors. MIT license.

//! Snapshot blob framing.
//!
//! ```text
//! | magic (8) | kind (1) | payload length (u64 LE) | payload |
//! ```

use crate::error::VmError;

pub const SNAPSHOT_MAGIC: [u8; 8] = *b"IHSNAP01";
pub const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 1 + 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotKind {
  Vm = 0,
  Isolate = 1,
  LoadingUnit = 2,
}

impl SnapshotKind {
  fn from_u8(value: u8) -> Option<Self> {
    match value {
      0 => Some(Self::Vm),
      1 => Some(Self::Isolate),
      2 => Some(Self::LoadingUnit),
      _ => None,
    }
  }
}

pub fn encode_snapshot(kind: SnapshotKind, payload: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
  out.extend_from_slice(&SNAPSHOT_MAGIC);
  out.push(kind as u8);
  out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
  out.extend_from_slice(payload);
  out
}

/// Total blob length as announced by a header, if `header` starts with one.
pub fn blob_len(header: &[u8]) -> Option<usize> {
  if header.len() < HEADER_LEN || header[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC
  {
    return None;
  }
  SnapshotKind::from_u8(header[SNAPSHOT_MAGIC.len()])?;
  let mut len = [0u8; 8];
  len.copy_from_slice(&header[SNAPSHOT_MAGIC.len() + 1..HEADER_LEN]);
  let payload_len = usize::try_from(u64::from_le_bytes(len)).ok()?;
  HEADER_LEN.checked_add(payload_len)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<(SnapshotKind, &[u8]), VmError> {
  let total = blob_len(bytes)
    .ok_or_else(|| VmError::api("Invalid snapshot: bad header"))?;
  if bytes.len() < total {
    return Err(VmError::api(format!(
      "Invalid snapshot: expected {total} bytes, found {}",
      bytes.len()
    )));
  }
  let kind = SnapshotKind::from_u8(bytes[SNAPSHOT_MAGIC.len()])
    .ok_or_else(|| VmError::api("Invalid snapshot: unknown kind"))?;
  Ok((kind, &bytes[HEADER_LEN..total]))
}
