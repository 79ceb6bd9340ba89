// Copyright 2018-2025 the Deno authors. MIT license.

use crate::checkin::runner::Fixture;
use crate::checkin::runner::testing::vm_test_guard;
use isolate_host::ServiceIsolate;
use isolate_host::VmRef;
use isolate_host::vm;
use std::sync::Arc;

#[test]
fn service_starts_with_the_vm_and_stops_with_it() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let output = fixture.output().clone();
  let mut settings = fixture.settings();
  settings.enable_vm_service = true;
  settings.disable_service_auth_codes = false;
  let recorder = output.clone();
  settings.service_isolate_create_callback =
    Some(Arc::new(move || recorder.line("service created")));

  let vm = VmRef::create(settings, None, None).unwrap();
  assert!(output.contains("service created"));
  assert!(vm::service_isolate().is_some());
  assert!(VmRef::get_service_protocol().unwrap().hooks_enabled());

  let uri = ServiceIsolate::server_uri().unwrap();
  assert!(uri.starts_with("http://127.0.0.1:"), "{uri}");
  let auth_code = uri.trim_end_matches('/').rsplit('/').next().unwrap();
  assert_eq!(auth_code.len(), 11, "{uri}");

  let recorder = output.clone();
  let id = ServiceIsolate::add_server_status_callback(Arc::new(
    move |uri: &str| recorder.line(format!("status '{uri}'")),
  ));
  // Registering while the service runs replays the current URI.
  assert!(output.contains(&format!("status '{uri}'")));

  drop(vm);
  assert!(ServiceIsolate::server_uri().is_none());
  assert!(output.contains("status ''"));
  assert!(ServiceIsolate::remove_server_status_callback(id));
  assert!(!ServiceIsolate::remove_server_status_callback(id));
}

#[test]
fn service_stays_off_unless_enabled() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let vm = VmRef::create(fixture.settings(), None, None).unwrap();

  assert!(vm::service_isolate().is_none());
  assert!(ServiceIsolate::server_uri().is_none());
  assert!(!vm.service_protocol().hooks_enabled());
}
