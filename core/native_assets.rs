// Copyright 2018-2025 the Deno authors. MIT license.

use crate::error::AnyError;
use anyhow::Context;
use anyhow::bail;
use serde_json::Value;
use std::collections::BTreeMap;

/// The `{os}_{arch}` key native assets are listed under for this build.
pub fn native_assets_target() -> String {
  let os = match std::env::consts::OS {
    "macos" => "macos",
    "ios" => "ios",
    "windows" => "windows",
    "android" => "android",
    "fuchsia" => "fuchsia",
    _ => "linux",
  };
  let arch = match std::env::consts::ARCH {
    "x86_64" => "x64",
    "x86" => "ia32",
    "aarch64" => "arm64",
    "arm" => "arm",
    "riscv64" => "riscv64",
    other => other,
  };
  format!("{os}_{arch}")
}

/// Resolves asset ids to the paths the application was packaged with.
///
/// The manifest is JSON of the form
///
/// ```json
/// {
///   "format-version": [1, 0, 0],
///   "native-assets": {
///     "linux_x64": {
///       "package:foo/foo.dart": ["absolute", "/usr/lib/libfoo.so"]
///     }
///   }
/// }
/// ```
#[derive(Debug, Default)]
pub struct NativeAssetsManager {
  // Asset id to path, e.g. ["absolute", "/usr/lib/libfoo.so"].
  assets: BTreeMap<String, Vec<String>>,
}

impl NativeAssetsManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces the known assets with those listed for this build's target in
  /// `manifest`. Malformed entries are skipped.
  pub fn register_native_assets(&mut self, manifest: &[u8]) -> Result<(), AnyError> {
    self.register_native_assets_for_target(manifest, &native_assets_target())
  }

  pub fn register_native_assets_for_target(
    &mut self,
    manifest: &[u8],
    target: &str,
  ) -> Result<(), AnyError> {
    self.assets.clear();
    let manifest: Value = serde_json::from_slice(manifest)
      .context("Native assets manifest is not valid JSON")?;
    let Some(native_assets) = manifest.get("native-assets") else {
      bail!("Native assets manifest has no native-assets entry");
    };
    let Some(target_assets) = native_assets.get(target) else {
      log::debug!("No native assets for target {target}");
      return Ok(());
    };
    let Some(target_assets) = target_assets.as_object() else {
      bail!("Native assets for {target} are not an object");
    };
    for (asset_id, path) in target_assets {
      let path = path.as_array().and_then(|parts| {
        parts
          .iter()
          .map(|part| part.as_str().map(str::to_string))
          .collect::<Option<Vec<_>>>()
      });
      match path {
        Some(path) if !path.is_empty() => {
          self.assets.insert(asset_id.clone(), path);
        }
        _ => log::warn!("Ignoring invalid native asset entry {asset_id}"),
      }
    }
    Ok(())
  }

  pub fn lookup_native_asset(&self, asset_id: &str) -> Option<&[String]> {
    self.assets.get(asset_id).map(Vec::as_slice)
  }

  /// A human readable list of the known asset ids, used in load errors.
  pub fn available_native_assets(&self) -> String {
    if self.assets.is_empty() {
      return "No available native assets.".to_string();
    }
    let ids: Vec<&str> = self.assets.keys().map(String::as_str).collect();
    format!("Available native assets: {}.", ids.join(", "))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  const MANIFEST: &str = r#"{
    "format-version": [1, 0, 0],
    "native-assets": {
      "linux_x64": {
        "package:foo/foo.dart": ["absolute", "/usr/lib/libfoo.so"],
        "package:bar/bar.dart": ["system", "libbar.so"],
        "package:bad/bad.dart": "not a list"
      },
      "macos_arm64": {
        "package:foo/foo.dart": ["absolute", "/usr/lib/libfoo.dylib"]
      }
    }
  }"#;

  #[test]
  fn parses_assets_for_target() {
    let mut manager = NativeAssetsManager::new();
    manager
      .register_native_assets_for_target(MANIFEST.as_bytes(), "linux_x64")
      .unwrap();
    assert_eq!(
      manager.lookup_native_asset("package:foo/foo.dart"),
      Some(&["absolute".to_string(), "/usr/lib/libfoo.so".to_string()][..])
    );
    assert!(manager.lookup_native_asset("package:bad/bad.dart").is_none());
    assert_eq!(
      manager.available_native_assets(),
      "Available native assets: package:bar/bar.dart, package:foo/foo.dart."
    );
  }

  #[test]
  fn unknown_target_has_no_assets() {
    let mut manager = NativeAssetsManager::new();
    manager
      .register_native_assets_for_target(MANIFEST.as_bytes(), "windows_ia32")
      .unwrap();
    assert_eq!(
      manager.available_native_assets(),
      "No available native assets."
    );
  }

  #[test]
  fn malformed_manifest_is_an_error() {
    let mut manager = NativeAssetsManager::new();
    assert!(manager.register_native_assets(b"{").is_err());
    assert!(manager.register_native_assets(b"{}").is_err());
  }

  #[test]
  fn target_names_use_short_arch() {
    let target = native_assets_target();
    assert!(!target.contains("x86_64"));
    assert!(!target.contains("aarch64"));
    assert!(target.contains('_'));
  }
}
