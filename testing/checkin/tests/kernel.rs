// Copyright 2018-2025 the Deno authors. MIT license.

use crate::checkin::runner::Fixture;
use crate::checkin::runner::snapshot::ROOT_LIBRARY;
use crate::checkin::runner::snapshot::main_kernel;
use crate::checkin::runner::testing::run_root_isolate;
use crate::checkin::runner::testing::vm_test_guard;
use crate::checkin::runner::thread_host::ThreadHost;
use isolate_host::IsolateError;
use isolate_host::VmErrorKind;
use isolate_host::VmRef;
use isolate_host::vm;
use isolate_host::vm::kernel::KernelProgram;
use pretty_assertions::assert_eq;
use rstest::rstest;

const UTIL_LIBRARY: &str = "file:///util.dart";

fn launch(fixture: &Fixture, label: &str) -> Result<(), IsolateError> {
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new(label).unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |_| {})?;
  assert!(fixture.output().wait_for("main()"));
  drop(isolate);
  Ok(())
}

#[test]
fn kernel_pieces_load_in_order() {
  let _guard = vm_test_guard();
  let mut fixture = Fixture::new();
  let util = KernelProgram::new(UTIL_LIBRARY).function("helper", "sayHi");
  let main = main_kernel().import(ROOT_LIBRARY, "util.dart");
  fixture.set_kernels(vec![util.to_bytes(), main.to_bytes()]);
  let settings = fixture.settings();
  let vm = VmRef::create(settings.clone(), None, None).unwrap();
  let host = ThreadHost::new("pieces").unwrap();
  let isolate = run_root_isolate(&vm, &host, &settings, |_| {}).unwrap();
  assert!(fixture.output().wait_for("main()"));

  let (root, helper) = isolate.run_in_isolate_scope(|| {
    let root = vm::root_library().map(|library| library.uri().to_string());
    let helper = vm::lookup_library(UTIL_LIBRARY)
      .and_then(|library| vm::invoke(&library, "helper", &[]));
    (root, helper)
  });
  assert_eq!(root.as_deref(), Some(ROOT_LIBRARY));
  assert!(helper.is_ok());
  assert!(fixture.output().contains("hi"));
  assert_eq!(isolate.isolate().group_data().kernel_buffers().len(), 2);
}

#[test]
fn runtime_imports_need_no_library() {
  let _guard = vm_test_guard();
  let mut fixture = Fixture::new();
  fixture.set_kernels(vec![
    main_kernel().import(ROOT_LIBRARY, "dart:async").to_bytes(),
  ]);
  launch(&fixture, "dart-import").unwrap();
}

#[rstest]
#[case::unresolved_import(main_kernel().import(ROOT_LIBRARY, "missing.dart"))]
#[case::unresolved_native(main_kernel().function("ghost", "ghost"))]
fn unfinalizable_program_is_a_compilation_error(#[case] program: KernelProgram) {
  let _guard = vm_test_guard();
  let mut fixture = Fixture::new();
  fixture.set_kernels(vec![program.to_bytes()]);

  let error = launch(&fixture, "unfinalizable").err().unwrap();
  assert!(
    matches!(&error, IsolateError::Vm(error) if error.kind == VmErrorKind::Compilation),
    "{error}"
  );
  assert!(fixture.output().lines().is_empty());
}

#[rstest]
#[case::no_pieces(vec![])]
#[case::not_a_kernel(vec![b"not a kernel".to_vec()])]
#[case::empty_piece(vec![Vec::new()])]
fn bad_kernel_list_is_rejected(#[case] kernels: Vec<Vec<u8>>) {
  let _guard = vm_test_guard();
  let mut fixture = Fixture::new();
  fixture.set_kernels(kernels);

  let error = launch(&fixture, "bad-kernel").err().unwrap();
  assert!(matches!(error, IsolateError::InvalidKernel), "{error}");
}
