// Copyright 2018-2025 the Deno authors. MIT license.

use crate::checkin::runner::Fixture;
use crate::checkin::runner::TestPlatformConfiguration;
use crate::checkin::runner::testing::run_root_isolate;
use crate::checkin::runner::testing::vm_test_guard;
use crate::checkin::runner::thread_host::ThreadHost;
use isolate_host::Isolate;
use isolate_host::Phase;
use isolate_host::VmError;
use isolate_host::VmErrorKind;
use isolate_host::VmRef;
use isolate_host::vm;
use isolate_host::vm::ServiceMessage;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

#[test]
fn open_ports_keep_the_isolate_alive() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let output = fixture.output();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("ports").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("keepAlive".to_string());
  })
  .unwrap();
  assert!(output.wait_for("listening"));
  let port = fixture.keep_alive_port().unwrap();
  assert_eq!(port.origin_id, isolate.vm_isolate().main_port().port_id);

  assert!(vm::post(port, json!("hello")));
  assert!(output.wait_for(r#"received "hello""#));
  isolate.flush_ui();
  let handler = isolate.isolate().message_handler();
  assert!(handler.handled_first_message());
  assert!(!handler.isolate_exited());

  assert!(vm::post(port, json!("close")));
  assert!(output.wait_for("closed"));
  isolate.flush_ui();
  assert!(isolate.isolate().message_handler().isolate_exited());
  assert!(!vm::post(port, json!("late")));
}

#[test]
fn epilogue_runs_after_each_message() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let output = fixture.output().clone();
  let mut settings = fixture.settings();
  let recorder = output.clone();
  settings.root_isolate_create_callback = Some(Arc::new(move |isolate: &Isolate| {
    let recorder = recorder.clone();
    isolate.set_message_epilogue(Some(Arc::new(
      move |result: &Result<(), VmError>| {
        recorder.line(format!("epilogue ok={}", result.is_ok()));
      },
    )));
  }));
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("epilogue").unwrap();
  let _isolate = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();

  assert!(output.wait_for("epilogue ok=true"));
  assert_eq!(output.lines(), vec!["main()", "epilogue ok=true"]);
}

#[test]
fn unhandled_exception_goes_to_settings_callback() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("unhandled").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("throwError".to_string());
  })
  .unwrap();

  assert!(fixture.output().wait_for("unhandled: boom"));
  isolate.flush_ui();
  let handler = isolate.isolate().message_handler();
  assert!(handler.isolate_had_uncaught_exception_error());
  assert!(!handler.isolate_had_fatal_error());
  assert_eq!(
    handler.isolate_last_error(),
    Some(VmErrorKind::UnhandledException)
  );
  // A handled exception does not end the isolate.
  assert_eq!(isolate.isolate().phase(), Phase::Running);
  assert!(!isolate.vm_isolate().is_shut_down());
}

#[test]
fn platform_configuration_sees_exceptions_first() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("platform-error").unwrap();
  let platform = TestPlatformConfiguration::new(fixture.output().clone(), true);
  let isolate = run_root_isolate(&vm, &host, &settings, move |options| {
    options.entrypoint = Some("throwError".to_string());
    options.platform_configuration = Some(platform);
  })
  .unwrap();

  assert!(fixture.output().wait_for("platform error: boom"));
  isolate.flush_ui();
  assert!(!fixture.output().contains("unhandled: boom"));
}

#[test]
fn exit_shuts_the_isolate_down() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let output = fixture.output().clone();
  let mut settings = fixture.settings();
  let recorder = output.clone();
  settings.isolate_shutdown_callback =
    Some(Arc::new(move || recorder.line("isolate shutdown")));
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("exit").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("exitIsolate".to_string());
  })
  .unwrap();

  assert!(output.wait_for("isolate shutdown"));
  isolate.flush_ui();
  assert_eq!(output.lines(), vec!["exiting", "isolate shutdown"]);
  let handler = isolate.isolate().message_handler();
  assert!(handler.isolate_had_fatal_error());
  assert_eq!(handler.isolate_last_error(), Some(VmErrorKind::Unwind));
  assert!(isolate.vm_isolate().is_shut_down());
  assert_eq!(isolate.isolate().phase(), Phase::Shutdown);
}

#[test]
fn kill_message_terminates_a_live_isolate() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let output = fixture.output().clone();
  let mut settings = fixture.settings();
  let recorder = output.clone();
  settings.isolate_shutdown_callback =
    Some(Arc::new(move || recorder.line("isolate shutdown")));
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("kill").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("keepAlive".to_string());
  })
  .unwrap();
  assert!(output.wait_for("listening"));

  assert!(vm::post_service_message(
    &isolate.vm_isolate(),
    ServiceMessage::Kill
  ));
  assert!(output.wait_for("isolate shutdown"));
  isolate.flush_ui();
  assert!(isolate.isolate().message_handler().isolate_had_fatal_error());
  assert!(isolate.vm_isolate().is_shut_down());
  let port = fixture.keep_alive_port().unwrap();
  assert!(!vm::post(port, json!("after kill")));
}

#[test]
fn paused_isolate_waits_for_resume() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let mut settings = fixture.settings();
  settings.start_paused = true;
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("paused").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();

  isolate.flush_ui();
  assert!(isolate.isolate().message_handler().handled_first_message());
  assert!(!fixture.output().contains("main()"));

  assert!(vm::post_service_message(
    &isolate.vm_isolate(),
    ServiceMessage::Resume
  ));
  assert!(fixture.output().wait_for("main()"));
}

#[test]
fn paused_on_exit_waits_for_resume() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let mut settings = fixture.settings();
  settings.vm_flags = vec!["--pause_isolates_on_exit".to_string()];
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("paused-exit").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();

  assert!(fixture.output().wait_for("main()"));
  isolate.flush_ui();
  assert!(!isolate.isolate().message_handler().isolate_exited());
  assert!(isolate.run_in_isolate_scope(vm::is_paused_on_exit));

  assert!(vm::post_service_message(
    &isolate.vm_isolate(),
    ServiceMessage::Resume
  ));
  isolate.flush_ui();
  assert!(isolate.isolate().message_handler().isolate_exited());
  assert!(!isolate.run_in_isolate_scope(vm::is_paused_on_exit));
}
