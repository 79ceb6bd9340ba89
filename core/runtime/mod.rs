// Copyright 2018-2025 the Deno authors. MIT license.
mod vm;
mod vm_data;

pub use vm::Vm;
pub use vm::VmRef;
pub use vm::vm_flags_for_settings;
pub use vm_data::VmData;
