// Copyright 2018-2025 the Deno authors. MIT license.

use isolate_host::vm::blob::SnapshotKind;
use isolate_host::vm::blob::encode_snapshot;
use isolate_host::vm::kernel::KernelProgram;

/// Root library of the fixture program.
pub const ROOT_LIBRARY: &str = "file:///main.dart";

pub fn create_vm_snapshot() -> Vec<u8> {
  encode_snapshot(SnapshotKind::Vm, &[])
}

/// An isolate snapshot carrying `program`, as a precompiled runtime expects.
/// Kernel runtimes ignore the payload.
pub fn create_isolate_snapshot(program: &KernelProgram) -> Vec<u8> {
  encode_snapshot(SnapshotKind::Isolate, &program.to_manifest())
}

pub fn create_loading_unit(program: &KernelProgram) -> Vec<u8> {
  encode_snapshot(SnapshotKind::LoadingUnit, &program.to_manifest())
}

/// The fixture program. Every function is backed by the native of the same
/// name registered by [`Fixture`](super::Fixture).
pub fn main_kernel() -> KernelProgram {
  KernelProgram::new(ROOT_LIBRARY)
    .function("main", "main")
    .function("sayHi", "sayHi")
    .function("throwError", "throwError")
    .function("exitIsolate", "exitIsolate")
    .function("keepAlive", "keepAlive")
    .function("spawnChild", "spawnChild")
    .function("childMain", "childMain")
    .function("spawnUri", "spawnUri")
    .function("loadDeferred", "loadDeferred")
    .function("whoAmI", "whoAmI")
}
