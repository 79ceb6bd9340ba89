// Copyright 2018-2025 the Deno authors. MIT license.

// A leaked VM lives until the process exits, so this runs in its own test
// binary.

use isolate_host::Vm;
use isolate_host::VmRef;
use isolate_host::vm;
use isolate_host_testing::Fixture;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn leaked_vm_outlives_its_references() -> anyhow::Result<()> {
  let _ = env_logger::builder().is_test(true).try_init();
  let fixture = Fixture::new();
  let mut settings = fixture.settings();
  settings.leak_vm = true;

  let first = VmRef::create(settings.clone(), None, None)?;
  let launches = Vm::vm_launch_count();
  let vm_data = first.vm_data().clone();
  drop(first);
  assert!(VmRef::is_instance_running());
  assert!(vm::is_initialized());

  let second = VmRef::create(settings, None, None)?;
  assert_eq!(Vm::vm_launch_count(), launches);
  assert!(Arc::ptr_eq(second.vm_data(), &vm_data));
  assert!(VmRef::get_vm_data().is_some());
  Ok(())
}
