// Copyright 2018-2025 the Deno authors. MIT license.

use crate::checkin::runner::Fixture;
use crate::checkin::runner::testing::run_root_isolate;
use crate::checkin::runner::testing::vm_test_guard;
use crate::checkin::runner::thread_host::ThreadHost;
use isolate_host::VmRef;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

#[test]
fn spawned_isolate_runs_in_the_parent_group() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let mut settings = fixture.settings();
  let created = Arc::new(AtomicUsize::new(0));
  let counter = created.clone();
  settings.isolate_create_callback = Some(Arc::new(move || {
    counter.fetch_add(1, Ordering::SeqCst);
  }));
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("spawn").unwrap();
  let _isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("spawnChild".to_string());
    options.entrypoint_args = vec!["7".to_string()];
  })
  .unwrap();

  assert!(fixture.output().wait_for("child(7) root=false"));
  // Once for the root isolate, once for the child.
  assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[test]
fn spawn_uri_creates_a_new_group() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("spawn-uri").unwrap();
  let _isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("spawnUri".to_string());
  })
  .unwrap();

  assert!(fixture.output().wait_for("main(spawned)"));
}

#[test]
fn spawn_uri_rejects_non_file_uris() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("spawn-https").unwrap();
  let _isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("spawnUri".to_string());
    options.entrypoint_args = vec!["https://example.com/a.dart".to_string()];
  })
  .unwrap();

  assert!(fixture.output().wait_for(
    "spawnUri failed: Unsupported isolate URI: https://example.com/a.dart"
  ));
  assert!(!fixture.output().contains("main(spawned)"));
}
