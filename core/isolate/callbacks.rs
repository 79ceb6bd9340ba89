// Copyright 2018-2025 the Deno authors. MIT license.

use super::Isolate;
use super::IsolateContext;
use super::IsolateGroupData;
use super::IsolateGroupOptions;
use super::IsolateKind;
use super::create_vm_isolate;
use super::initialize_isolate;
use crate::service_isolate;
use crate::tasks::TaskRunners;
use crate::vm;
use crate::vm::CreateGroupRequest;
use crate::vm::GroupData;
use crate::vm::IsolateData;
use crate::vm::IsolateGroupCallbacks;
use crate::vm::VmIsolate;
use std::sync::Arc;

const FILE_URI_PREFIX: &str = "file://";

/// Answers the runtime's lifecycle callbacks with [`Isolate`]s.
pub(crate) struct EmbedderCallbacks;

enum GroupCreateKind {
  /// The runtime starts the service isolate itself.
  Service,
  SpawnUri(Arc<Isolate>),
  Unsupported(String),
  Declined,
}

impl GroupCreateKind {
  fn classify(request: &CreateGroupRequest) -> Self {
    let parent = request
      .parent_data
      .clone()
      .and_then(|data| data.downcast::<Isolate>().ok());
    match parent {
      None if request.script_uri == vm::SERVICE_ISOLATE_NAME => Self::Service,
      None => Self::Declined,
      Some(_) if !request.script_uri.starts_with(FILE_URI_PREFIX) => {
        Self::Unsupported(request.script_uri.clone())
      }
      Some(parent) => Self::SpawnUri(parent),
    }
  }
}

fn null_task_runners(label: &str) -> TaskRunners {
  TaskRunners {
    label: label.to_string(),
    ..Default::default()
  }
}

fn spawn_uri_group(
  parent: &Isolate,
  request: CreateGroupRequest,
) -> Result<VmIsolate, String> {
  let parent_group = parent.group_data();
  let group_data = Arc::new(IsolateGroupData::new(IsolateGroupOptions {
    settings: parent_group.settings().clone(),
    isolate_snapshot: parent_group.isolate_snapshot().clone(),
    advisory_script_uri: request.script_uri.clone(),
    advisory_script_entrypoint: request.main.clone(),
    child_isolate_preparer: parent_group.child_isolate_preparer(),
    isolate_create_callback: parent_group.isolate_create_callback().cloned(),
    isolate_shutdown_callback: parent_group.isolate_shutdown_callback().cloned(),
    native_assets_manager: parent_group.native_assets_manager().cloned(),
  }));
  let context = IsolateContext {
    task_runners: null_task_runners(&request.script_uri),
    advisory_script_uri: request.script_uri.clone(),
    advisory_script_entrypoint: request.main.clone(),
  };
  let isolate = Arc::new(Isolate::new(
    group_data.settings().clone(),
    group_data.clone(),
    context,
    IsolateKind::Child,
  ));
  create_vm_isolate(&isolate, |data| {
    let group: GroupData = group_data.clone();
    vm::create_isolate_group(
      &request.script_uri,
      &request.main,
      group_data.isolate_snapshot(),
      request.flags,
      group,
      data,
    )
  })
  .map_err(|error| {
    log::error!("Could not create isolate group for {}: {error}", request.script_uri);
    error.to_string()
  })
}

impl IsolateGroupCallbacks for EmbedderCallbacks {
  fn create_group(
    &self,
    request: CreateGroupRequest,
  ) -> Result<Option<VmIsolate>, String> {
    match GroupCreateKind::classify(&request) {
      GroupCreateKind::Service => {
        service_isolate::create_and_start_service_isolate(request)
      }
      GroupCreateKind::SpawnUri(parent) => {
        spawn_uri_group(&parent, request).map(Some)
      }
      GroupCreateKind::Unsupported(uri) => {
        Err(format!("Unsupported isolate URI: {uri}"))
      }
      GroupCreateKind::Declined => Ok(None),
    }
  }

  fn initialize_isolate(&self, vm_isolate: &VmIsolate) -> Result<IsolateData, String> {
    let Some(group_data) = vm_isolate
      .group_data()
      .and_then(|data| data.downcast::<IsolateGroupData>().ok())
    else {
      return Err("Isolate group has no embedder data".to_string());
    };
    if vm::current_isolate().as_ref() != Some(vm_isolate) {
      return Err("Isolate should be available in initialize callback.".to_string());
    }
    let context = IsolateContext {
      task_runners: null_task_runners(group_data.advisory_script_uri()),
      advisory_script_uri: group_data.advisory_script_uri().to_string(),
      advisory_script_entrypoint: group_data
        .advisory_script_entrypoint()
        .to_string(),
    };
    let isolate = Arc::new(Isolate::new(
      group_data.settings().clone(),
      group_data,
      context,
      IsolateKind::Child,
    ));
    // On failure the runtime shuts the isolate down itself.
    initialize_isolate(&isolate, vm_isolate).map_err(|error| error.to_string())?;
    Ok(isolate)
  }

  fn shutdown_isolate(
    &self,
    _vm_isolate: &VmIsolate,
    _group_data: Option<&GroupData>,
    isolate_data: Option<&IsolateData>,
  ) {
    let isolate = isolate_data.and_then(|data| data.clone().downcast::<Isolate>().ok());
    if let Some(isolate) = isolate {
      isolate.on_shutdown_callback();
    }
  }

  fn cleanup_isolate(
    &self,
    _group_data: Option<GroupData>,
    isolate_data: Option<IsolateData>,
  ) {
    if let Some(isolate) = isolate_data.and_then(|data| data.downcast::<Isolate>().ok()) {
      log::trace!("Releasing isolate {}", isolate.advisory_script_entrypoint());
    }
  }

  fn cleanup_group(&self, group_data: Option<GroupData>) {
    if let Some(group_data) =
      group_data.and_then(|data| data.downcast::<IsolateGroupData>().ok())
    {
      log::trace!("Releasing isolate group {}", group_data.advisory_script_uri());
    }
  }
}
