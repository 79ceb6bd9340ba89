// Copyright 2018-2025 the Deno authors. MIT license.

use crate::checkin::runner::Fixture;
use crate::checkin::runner::snapshot::ROOT_LIBRARY;
use crate::checkin::runner::testing::run_root_isolate;
use crate::checkin::runner::testing::vm_test_guard;
use crate::checkin::runner::thread_host::ThreadHost;
use isolate_host::Isolate;
use isolate_host::IsolateError;
use isolate_host::IsolateLaunchType;
use isolate_host::Phase;
use isolate_host::Snapshot;
use isolate_host::VmRef;
use isolate_host::infer_from_settings;
use isolate_host::vm;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

#[test]
fn root_isolate_runs_main_after_create_callbacks() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let output = fixture.output().clone();
  let mut settings = fixture.settings();
  let recorder = output.clone();
  settings.root_isolate_create_callback = Some(Arc::new(move |isolate: &Isolate| {
    recorder.line(format!(
      "root created in {:?}, current={}",
      isolate.phase(),
      vm::current_isolate().is_some()
    ));
  }));
  let recorder = output.clone();
  settings.isolate_create_callback =
    Some(Arc::new(move || recorder.line("isolate created")));
  let recorder = output.clone();
  settings.root_isolate_shutdown_callback =
    Some(Arc::new(move || recorder.line("root shutdown")));
  let recorder = output.clone();
  settings.isolate_shutdown_callback =
    Some(Arc::new(move || recorder.line("isolate shutdown")));

  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("root").unwrap();
  let recorder = output.clone();
  let isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint_args = vec!["a".to_string(), "b".to_string()];
    options.root_isolate_create_callback =
      Some(Arc::new(move || recorder.line("options created")));
  })
  .unwrap();

  assert!(output.wait_for("main(a,b)"));
  assert_eq!(
    output.take(),
    vec![
      "root created in Ready, current=true",
      "options created",
      "isolate created",
      "main(a,b)",
    ]
  );
  assert_eq!(isolate.isolate().phase(), Phase::Running);
  assert!(isolate.isolate().is_root_isolate());
  assert!(!isolate.isolate().is_spawning_in_group());
  assert!(isolate.isolate().root_isolate_token() > 0);
  assert!(isolate.vm_isolate().is_group_root());
  assert_eq!(isolate.isolate().advisory_script_uri(), ROOT_LIBRARY);

  drop(isolate);
  assert_eq!(output.take(), vec!["root shutdown", "isolate shutdown"]);
}

#[test]
fn entrypoint_and_library_can_be_chosen() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("entrypoint").unwrap();

  let _isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("sayHi".to_string());
    options.entrypoint_library = Some(ROOT_LIBRARY.to_string());
  })
  .unwrap();
  assert!(fixture.output().wait_for("hi"));
  assert!(!fixture.output().contains("main()"));
}

#[test]
fn natives_see_the_embedder_isolate() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("who").unwrap();

  let _isolate = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("whoAmI".to_string());
  })
  .unwrap();
  assert!(fixture.output().wait_for("root=true platform=false"));
}

#[test]
fn unknown_entrypoint_is_an_error() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let output = fixture.output().clone();
  let mut settings = fixture.settings();
  let recorder = output.clone();
  settings.isolate_shutdown_callback =
    Some(Arc::new(move || recorder.line("isolate shutdown")));
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("unknown").unwrap();

  let error = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint = Some("nope".to_string());
  })
  .err()
  .unwrap();
  assert!(matches!(error, IsolateError::EntrypointNotFound(name) if name == "nope"));
  // The half-made isolate was torn down again.
  assert_eq!(output.lines(), vec!["isolate shutdown"]);

  let error = run_root_isolate(&vm, &host, &settings, |options| {
    options.entrypoint_library = Some("file:///missing.dart".to_string());
  })
  .err()
  .unwrap();
  assert!(matches!(error, IsolateError::EntrypointNotFound(_)));
}

#[test]
fn creation_needs_a_configuration_and_a_snapshot() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("invalid").unwrap();

  // Nothing to infer a configuration from.
  let error = run_root_isolate(&vm, &host, &settings, |options| {
    options.settings.application_kernels = None;
  })
  .err()
  .unwrap();
  assert!(matches!(error, IsolateError::MissingConfiguration));

  let error = run_root_isolate(&vm, &host, &settings, |options| {
    options.isolate_snapshot = Some(Snapshot::new(None, None));
  })
  .err()
  .unwrap();
  assert!(matches!(error, IsolateError::InvalidSnapshot));
  assert!(fixture.output().lines().is_empty());
}

#[test]
fn shutdown_happens_once() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("shutdown").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();
  assert!(fixture.output().wait_for("main()"));

  assert!(isolate.run_on_ui(|isolate| isolate.shutdown()).is_ok());
  let again = isolate.run_on_ui(|isolate| isolate.shutdown());
  assert!(matches!(again, Err(IsolateError::AlreadyShutdown)));
  assert_eq!(isolate.isolate().phase(), Phase::Shutdown);
  assert!(isolate.vm_isolate().is_shut_down());
  assert!(matches!(
    isolate.isolate().scope(),
    Err(IsolateError::AlreadyShutdown)
  ));
}

#[test]
fn shutdown_callbacks_fire_once_in_scope() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let output = fixture.output().clone();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("shutdown-callback").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();
  assert!(output.wait_for("main()"));

  let recorder = output.clone();
  isolate.run_on_ui(move |isolate| {
    isolate.add_isolate_shutdown_callback(move || {
      recorder.line(format!(
        "shutdown callback, current={}",
        vm::current_isolate().is_some()
      ));
    });
  });
  assert!(isolate.run_on_ui(|isolate| isolate.shutdown()).is_ok());
  drop(isolate);
  assert_eq!(
    output.lines(),
    vec!["main()", "shutdown callback, current=true"]
  );
}

#[test]
fn network_policy_comes_from_settings() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let mut settings = fixture.settings();
  settings.may_insecurely_connect_to_all_domains = false;
  settings.domain_network_policy = r#"["example.com",true]"#.to_string();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("policy").unwrap();

  let isolate = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();
  assert!(!isolate.isolate().may_insecurely_connect_to_all_domains());
  assert_eq!(
    isolate.isolate().domain_network_policy(),
    r#"["example.com",true]"#
  );
}

#[test]
fn root_isolate_can_join_an_existing_group() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let mut settings = fixture.settings();
  let produced = Arc::new(AtomicUsize::new(0));
  if let Some(producer) = settings.application_kernels.clone() {
    let counter = produced.clone();
    settings.application_kernels = Some(Arc::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      producer()
    }));
  }
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("group").unwrap();

  let first = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();
  assert!(fixture.output().wait_for("main()"));

  let spawning = first.isolate().clone();
  let second = run_root_isolate(&vm, &host, &settings, move |options| {
    options.isolate_snapshot = None;
    options.isolate_configuration =
      infer_from_settings(&options.settings, None, IsolateLaunchType::ExistingGroup);
    options.entrypoint = Some("sayHi".to_string());
    options.spawning_isolate = Some(spawning);
  })
  .unwrap();
  assert!(fixture.output().wait_for("hi"));

  assert!(second.isolate().is_spawning_in_group());
  assert!(second.vm_isolate().same_group(&first.vm_isolate()));
  assert!(!second.vm_isolate().is_group_root());
  assert!(Arc::ptr_eq(
    second.isolate().group_data(),
    first.isolate().group_data()
  ));
  assert_ne!(
    second.isolate().root_isolate_token(),
    first.isolate().root_isolate_token()
  );
  // The group's kernel pieces were fetched once, for the first isolate.
  assert_eq!(produced.load(Ordering::SeqCst), 1);
  drop(second);
  drop(first);
}

#[test]
fn spawning_from_a_dead_isolate_fails() {
  let _guard = vm_test_guard();
  let fixture = Fixture::new();
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("dead").unwrap();

  let first = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();
  assert!(first.run_on_ui(|isolate| isolate.shutdown()).is_ok());

  let spawning = first.isolate().clone();
  let error = run_root_isolate(&vm, &host, &settings, move |options| {
    options.spawning_isolate = Some(spawning);
  })
  .err()
  .unwrap();
  assert!(matches!(error, IsolateError::AlreadyShutdown));
}
