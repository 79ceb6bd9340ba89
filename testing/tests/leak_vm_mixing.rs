// Copyright 2018-2025 the Deno authors. MIT license.

// Leaves a leaked VM behind, so this runs in its own test binary.

use isolate_host::VmRef;
use isolate_host_testing::Fixture;

#[test]
#[should_panic(expected = "leak VM flag")]
fn owned_vm_after_a_leaked_one_panics() {
  let _ = env_logger::builder().is_test(true).try_init();
  let fixture = Fixture::new();
  let mut settings = fixture.settings();
  settings.leak_vm = true;
  let leaked = VmRef::create(settings.clone(), None, None).unwrap();
  drop(leaked);

  settings.leak_vm = false;
  let _owned = VmRef::create(settings, None, None);
}
