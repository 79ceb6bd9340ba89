// Copyright 2018-2025 the Deno authors. MIT license.

//! The embedder side of a runtime isolate.
//!
//! An [`Isolate`] moves through the phases of [`Phase`] in order and never
//! goes back. The runtime owns it once it has been created: the isolate is
//! stored as the runtime isolate's payload and released by the cleanup
//! callback, so embedders only ever hold a [`Weak`] handle to a root
//! isolate.

mod callbacks;
mod configuration;
mod group_data;
mod message_handler;
mod platform_isolate_manager;

pub(crate) use callbacks::EmbedderCallbacks;
pub use configuration::AppSnapshotIsolateConfiguration;
pub use configuration::IsolateConfiguration;
pub use configuration::IsolateLaunchType;
pub use configuration::KernelIsolateConfiguration;
pub use configuration::KernelListIsolateConfiguration;
pub use configuration::infer_from_settings;
pub use group_data::ChildIsolatePreparer;
pub use group_data::IsolateGroupData;
pub use group_data::IsolateGroupOptions;
pub use message_handler::MessageHandler;
pub use message_handler::TaskDispatcher;
pub use platform_isolate_manager::PlatformIsolateManager;

use crate::closure::AutoFireClosure;
use crate::closure::ScopedCleanupClosure;
use crate::error::IsolateError;
use crate::error::VmError;
use crate::mapping::Mapping;
use crate::native_assets::NativeAssetsManager;
use crate::platform_configuration::PlatformConfiguration;
use crate::settings::IsolateCallback;
use crate::settings::Settings;
use crate::snapshot::Snapshot;
use crate::tasks::Task;
use crate::tasks::TaskRunner;
use crate::tasks::TaskRunners;
use crate::vm;
use crate::vm::GroupData;
use crate::vm::IsolateData;
use crate::vm::IsolateFlags;
use crate::vm::IsolateHooks;
use crate::vm::IsolateScope;
use crate::vm::NativeFunction;
use crate::vm::VmIsolate;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

static NEXT_ROOT_ISOLATE_TOKEN: AtomicI64 = AtomicI64::new(1);

const DEFAULT_ENTRYPOINT: &str = "main";

/// The lifecycle of an [`Isolate`], in the only order it may be walked.
/// Any phase may jump straight to [`Phase::Shutdown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
  Unknown,
  Uninitialized,
  Initialized,
  LibrariesSetup,
  Ready,
  Running,
  Shutdown,
}

impl Phase {
  pub fn next(self) -> Option<Phase> {
    match self {
      Phase::Unknown => Some(Phase::Uninitialized),
      Phase::Uninitialized => Some(Phase::Initialized),
      Phase::Initialized => Some(Phase::LibrariesSetup),
      Phase::LibrariesSetup => Some(Phase::Ready),
      Phase::Ready => Some(Phase::Running),
      Phase::Running => Some(Phase::Shutdown),
      Phase::Shutdown => None,
    }
  }
}

/// Runs after every message the isolate handles, with its result.
pub type MessageEpilogue = Arc<dyn Fn(&Result<(), VmError>) + Send + Sync>;

/// Where an isolate runs and what it reports itself as.
#[derive(Clone, Debug, Default)]
pub struct IsolateContext {
  pub task_runners: TaskRunners,
  pub advisory_script_uri: String,
  pub advisory_script_entrypoint: String,
}

/// Everything needed to create and start a root isolate.
///
/// ```ignore
/// let isolate = Isolate::create_running_root_isolate(RootIsolateOptions {
///   settings: settings.clone(),
///   isolate_snapshot: vm.vm_data().isolate_snapshot().clone().into(),
///   isolate_configuration: infer_from_settings(&settings, None, IsolateLaunchType::NewGroup),
///   context,
///   ..Default::default()
/// })?;
/// ```
#[derive(Default)]
pub struct RootIsolateOptions {
  pub settings: Settings,
  pub isolate_snapshot: Option<Arc<Snapshot>>,
  pub platform_configuration: Option<Arc<dyn PlatformConfiguration>>,
  pub flags: IsolateFlags,
  /// Fired once the isolate is ready, before its entrypoint runs. The
  /// isolate is not current.
  pub root_isolate_create_callback: Option<IsolateCallback>,
  /// Override the callbacks of the same name in `settings`.
  pub isolate_create_callback: Option<IsolateCallback>,
  pub isolate_shutdown_callback: Option<IsolateCallback>,
  /// Defaults to `main`.
  pub entrypoint: Option<String>,
  /// Defaults to the root library.
  pub entrypoint_library: Option<String>,
  pub entrypoint_args: Vec<String>,
  pub isolate_configuration: Option<Box<dyn IsolateConfiguration>>,
  pub context: IsolateContext,
  /// Creates the isolate in the group of this isolate, reusing what the
  /// group has already loaded.
  pub spawning_isolate: Option<Arc<Isolate>>,
  pub native_assets_manager: Option<Arc<NativeAssetsManager>>,
}

pub(crate) struct RootIsolateSetup<'a> {
  pub settings: &'a Settings,
  pub isolate_snapshot: Arc<Snapshot>,
  pub platform_configuration: Option<Arc<dyn PlatformConfiguration>>,
  pub flags: IsolateFlags,
  pub isolate_create_callback: Option<IsolateCallback>,
  pub isolate_shutdown_callback: Option<IsolateCallback>,
  pub context: IsolateContext,
  pub spawning_isolate: Option<&'a Isolate>,
  pub native_assets_manager: Option<Arc<NativeAssetsManager>>,
}

enum IsolateKind {
  Root {
    platform_configuration: Option<Arc<dyn PlatformConfiguration>>,
    is_spawning_in_group: bool,
  },
  /// Spawned by the runtime into an existing group, or into a new group
  /// created for a URI.
  Child,
  Platform {
    manager: Arc<PlatformIsolateManager>,
  },
}

pub struct Isolate {
  settings: Settings,
  context: IsolateContext,
  group_data: Arc<IsolateGroupData>,
  platform_configuration: Option<Arc<dyn PlatformConfiguration>>,
  platform_isolate_manager: Option<Arc<PlatformIsolateManager>>,
  platform_isolate_registered: AtomicBool,
  phase: Mutex<Phase>,
  vm_isolate: OnceCell<VmIsolate>,
  message_handling_task_runner: OnceCell<Arc<dyn TaskRunner>>,
  message_handler: MessageHandler,
  message_epilogue: Mutex<Option<MessageEpilogue>>,
  shutdown_callbacks: Mutex<SmallVec<[AutoFireClosure; 2]>>,
  loading_unit_snapshots: Mutex<Vec<Arc<Snapshot>>>,
  is_shutting_down: AtomicBool,
  is_root: bool,
  is_platform_isolate: bool,
  is_spawning_in_group: bool,
  may_insecurely_connect_to_all_domains: bool,
  domain_network_policy: String,
  root_isolate_token: i64,
}

impl Isolate {
  fn new(
    settings: Settings,
    group_data: Arc<IsolateGroupData>,
    context: IsolateContext,
    kind: IsolateKind,
  ) -> Self {
    let (platform_configuration, platform_isolate_manager, is_spawning_in_group) =
      match &kind {
        IsolateKind::Root {
          platform_configuration,
          is_spawning_in_group,
        } => (platform_configuration.clone(), None, *is_spawning_in_group),
        IsolateKind::Child => (None, None, false),
        IsolateKind::Platform { manager } => (None, Some(manager.clone()), false),
      };
    let is_root = matches!(kind, IsolateKind::Root { .. });
    let root_isolate_token = if is_root {
      NEXT_ROOT_ISOLATE_TOKEN.fetch_add(1, Ordering::Relaxed)
    } else {
      0
    };
    Self {
      may_insecurely_connect_to_all_domains: settings
        .may_insecurely_connect_to_all_domains,
      domain_network_policy: settings.domain_network_policy.clone(),
      settings,
      context,
      group_data,
      platform_configuration,
      platform_isolate_registered: AtomicBool::new(false),
      is_platform_isolate: platform_isolate_manager.is_some(),
      platform_isolate_manager,
      // Construction is the Unknown -> Uninitialized step.
      phase: Mutex::new(Phase::Uninitialized),
      vm_isolate: OnceCell::new(),
      message_handling_task_runner: OnceCell::new(),
      message_handler: MessageHandler::default(),
      message_epilogue: Mutex::new(None),
      shutdown_callbacks: Mutex::new(SmallVec::new()),
      loading_unit_snapshots: Mutex::new(Vec::new()),
      is_shutting_down: AtomicBool::new(false),
      is_root,
      is_spawning_in_group,
      root_isolate_token,
    }
  }

  /// Creates a root isolate, prepares it with `isolate_configuration` and
  /// starts its entrypoint.
  ///
  /// On any failure the partially created isolate is shut down again. The
  /// returned handle is weak: once running, the runtime decides when the
  /// isolate goes away.
  pub fn create_running_root_isolate(
    options: RootIsolateOptions,
  ) -> Result<Weak<Isolate>, IsolateError> {
    let RootIsolateOptions {
      settings,
      isolate_snapshot,
      platform_configuration,
      mut flags,
      root_isolate_create_callback,
      isolate_create_callback,
      isolate_shutdown_callback,
      entrypoint,
      entrypoint_library,
      entrypoint_args,
      isolate_configuration,
      context,
      spawning_isolate,
      native_assets_manager,
    } = options;

    let Some(mut isolate_configuration) = isolate_configuration else {
      log::error!("Invalid isolate configuration");
      return Err(IsolateError::MissingConfiguration);
    };
    let isolate_snapshot = isolate_snapshot.or_else(|| {
      spawning_isolate
        .as_ref()
        .map(|spawning| spawning.group_data.isolate_snapshot().clone())
    });
    let Some(isolate_snapshot) = isolate_snapshot.filter(|s| s.is_valid()) else {
      log::error!("Invalid isolate snapshot");
      return Err(IsolateError::InvalidSnapshot);
    };
    flags.is_dont_need_safe = isolate_snapshot.is_dont_need_safe();

    let weak = Self::create_root_isolate(RootIsolateSetup {
      settings: &settings,
      isolate_snapshot,
      platform_configuration,
      flags,
      isolate_create_callback: isolate_create_callback
        .or_else(|| settings.isolate_create_callback.clone()),
      isolate_shutdown_callback: isolate_shutdown_callback
        .or_else(|| settings.isolate_shutdown_callback.clone()),
      context,
      spawning_isolate: spawning_isolate.as_deref(),
      native_assets_manager,
    })?;
    let Some(isolate) = weak.upgrade() else {
      log::error!("Could not create root isolate.");
      return Err(IsolateError::Create(
        "Root isolate was collected during creation".to_string(),
      ));
    };

    let shutdown_target = isolate.clone();
    let mut shutdown_on_error = ScopedCleanupClosure::new(move || {
      if let Err(error) = shutdown_target.shutdown() {
        log::debug!("Discarding root isolate: {error}");
      }
    });

    let phase = isolate.phase();
    if phase != Phase::LibrariesSetup {
      log::error!("Root isolate was created in an incorrect phase: {phase:?}");
      return Err(IsolateError::WrongPhase {
        expected: Phase::LibrariesSetup,
        actual: phase,
      });
    }

    if let Err(error) = isolate_configuration.prepare_isolate(&isolate) {
      log::error!("Could not prepare isolate: {error}");
      return Err(error);
    }

    let phase = isolate.phase();
    if phase != Phase::Ready {
      log::error!("Root isolate not in the ready phase for entrypoint invocation.");
      return Err(IsolateError::WrongPhase {
        expected: Phase::Ready,
        actual: phase,
      });
    }

    isolate.set_owner_to_current_thread();

    if let Some(callback) = &settings.root_isolate_create_callback {
      // Create callbacks always run in isolate scope, before any user code.
      let _scope = isolate.scope()?;
      callback(isolate.as_ref());
    }
    if let Some(callback) = &root_isolate_create_callback {
      callback();
    }

    if let Err(error) = isolate.run_from_library(
      entrypoint_library.as_deref(),
      entrypoint.as_deref(),
      entrypoint_args,
    ) {
      log::error!("Could not run the main entrypoint: {error}");
      return Err(error);
    }

    if let Some(callback) = settings.root_isolate_shutdown_callback.clone() {
      isolate.add_isolate_shutdown_callback(move || callback());
    }

    shutdown_on_error.release();
    Ok(weak)
  }

  /// Creates a root isolate and sets it up to the
  /// [`Phase::LibrariesSetup`] phase. The isolate is not current on return.
  pub(crate) fn create_root_isolate(
    setup: RootIsolateSetup<'_>,
  ) -> Result<Weak<Isolate>, IsolateError> {
    let RootIsolateSetup {
      settings,
      isolate_snapshot,
      platform_configuration,
      flags,
      isolate_create_callback,
      isolate_shutdown_callback,
      context,
      spawning_isolate,
      native_assets_manager,
    } = setup;

    let spawning_vm_isolate = match spawning_isolate {
      Some(spawning) => match spawning.vm_isolate() {
        Some(vm_isolate) if !vm_isolate.is_shut_down() => Some(vm_isolate.clone()),
        _ => {
          log::error!("The spawning isolate has already shut down");
          return Err(IsolateError::AlreadyShutdown);
        }
      },
      None => None,
    };

    let group_data = match spawning_isolate {
      Some(spawning) => spawning.group_data.clone(),
      None => Arc::new(IsolateGroupData::new(IsolateGroupOptions {
        settings: settings.clone(),
        isolate_snapshot: isolate_snapshot.clone(),
        advisory_script_uri: context.advisory_script_uri.clone(),
        advisory_script_entrypoint: context.advisory_script_entrypoint.clone(),
        child_isolate_preparer: None,
        isolate_create_callback,
        isolate_shutdown_callback,
        native_assets_manager,
      })),
    };

    let script_uri = context.advisory_script_uri.clone();
    let name = context.advisory_script_entrypoint.clone();
    let isolate = Arc::new(Isolate::new(
      settings.clone(),
      group_data.clone(),
      context,
      IsolateKind::Root {
        platform_configuration,
        is_spawning_in_group: spawning_isolate.is_some(),
      },
    ));

    match spawning_vm_isolate {
      Some(spawning) => create_vm_isolate(&isolate, |data| {
        vm::create_isolate_in_group(
          &spawning,
          &name,
          IsolateHooks::default(),
          Some(data),
        )
      })?,
      None => create_vm_isolate(&isolate, |data| {
        let group: GroupData = group_data.clone();
        vm::create_isolate_group(
          &script_uri,
          &name,
          &isolate_snapshot,
          flags,
          group,
          data,
        )
      })?,
    };

    Ok(Arc::downgrade(&isolate))
  }

  /// The isolate whose runtime isolate is current on this thread.
  pub fn current() -> Option<Arc<Isolate>> {
    vm::current_isolate().and_then(|isolate| Self::from_vm(&isolate))
  }

  pub fn from_vm(vm_isolate: &VmIsolate) -> Option<Arc<Isolate>> {
    vm_isolate
      .data()
      .and_then(|data| data.downcast::<Isolate>().ok())
  }

  pub fn phase(&self) -> Phase {
    *self.phase.lock()
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn context(&self) -> &IsolateContext {
    &self.context
  }

  pub fn task_runners(&self) -> &TaskRunners {
    &self.context.task_runners
  }

  pub fn advisory_script_uri(&self) -> &str {
    &self.context.advisory_script_uri
  }

  pub fn advisory_script_entrypoint(&self) -> &str {
    &self.context.advisory_script_entrypoint
  }

  pub fn group_data(&self) -> &Arc<IsolateGroupData> {
    &self.group_data
  }

  pub fn platform_configuration(&self) -> Option<&Arc<dyn PlatformConfiguration>> {
    self.platform_configuration.as_ref()
  }

  pub fn vm_isolate(&self) -> Option<&VmIsolate> {
    self.vm_isolate.get()
  }

  pub fn message_handler(&self) -> &MessageHandler {
    &self.message_handler
  }

  pub fn message_handling_task_runner(&self) -> Option<&Arc<dyn TaskRunner>> {
    self.message_handling_task_runner.get()
  }

  pub fn set_message_epilogue(&self, epilogue: Option<MessageEpilogue>) {
    *self.message_epilogue.lock() = epilogue;
  }

  pub(crate) fn message_epilogue(&self) -> Option<MessageEpilogue> {
    self.message_epilogue.lock().clone()
  }

  pub fn is_root_isolate(&self) -> bool {
    self.is_root
  }

  pub fn is_platform_isolate(&self) -> bool {
    self.is_platform_isolate
  }

  pub fn is_spawning_in_group(&self) -> bool {
    self.is_spawning_in_group
  }

  pub fn is_shutting_down(&self) -> bool {
    self.is_shutting_down.load(Ordering::SeqCst)
  }

  pub fn may_insecurely_connect_to_all_domains(&self) -> bool {
    self.may_insecurely_connect_to_all_domains
  }

  pub fn domain_network_policy(&self) -> &str {
    &self.domain_network_policy
  }

  /// Identifies a root isolate to the platform. Zero for every other
  /// isolate.
  pub fn root_isolate_token(&self) -> i64 {
    self.root_isolate_token
  }

  pub fn loading_unit_snapshots(&self) -> Vec<Arc<Snapshot>> {
    self.loading_unit_snapshots.lock().clone()
  }

  /// Makes the calling thread the owner of this isolate, see
  /// [`vm::current_thread_owns_isolate`].
  pub fn set_owner_to_current_thread(&self) {
    match self.scope() {
      Ok(_scope) => vm::set_current_thread_owns_isolate(),
      Err(error) => log::debug!("Cannot take ownership of isolate: {error}"),
    }
  }

  /// Enters the runtime isolate for the lifetime of the returned scope.
  pub fn scope(&self) -> Result<IsolateScope, IsolateError> {
    let Some(vm_isolate) = self.vm_isolate.get() else {
      return Err(IsolateError::WrongPhase {
        expected: Phase::Initialized,
        actual: self.phase(),
      });
    };
    if vm_isolate.is_shut_down() {
      return Err(IsolateError::AlreadyShutdown);
    }
    Ok(IsolateScope::new(vm_isolate))
  }

  fn expect_phase(&self, expected: Phase) -> Result<(), IsolateError> {
    let actual = self.phase();
    if actual != expected {
      return Err(IsolateError::WrongPhase { expected, actual });
    }
    Ok(())
  }

  /// The only way the phase moves forward. Rejects anything but a step to
  /// the next phase or to [`Phase::Shutdown`].
  fn transition(&self, from: Phase, to: Phase) -> Result<(), IsolateError> {
    let mut phase = self.phase.lock();
    if *phase != from {
      return Err(IsolateError::WrongPhase {
        expected: from,
        actual: *phase,
      });
    }
    if from.next() != Some(to) && to != Phase::Shutdown {
      return Err(IsolateError::InvalidTransition { from, to });
    }
    log::trace!(
      "Isolate {} moved from {from:?} to {to:?}",
      self.advisory_script_entrypoint()
    );
    *phase = to;
    Ok(())
  }

  fn initialize(&self, vm_isolate: &VmIsolate) -> Result<(), IsolateError> {
    self.expect_phase(Phase::Uninitialized)?;
    if vm::current_isolate().as_ref() != Some(vm_isolate) {
      return Err(IsolateError::Create(
        "The isolate must be current to be initialized".to_string(),
      ));
    }
    if self.vm_isolate.set(vm_isolate.clone()).is_err() {
      return Err(IsolateError::Create(
        "The isolate was already initialized".to_string(),
      ));
    }

    let task_runners = &self.context.task_runners;
    let runner = if self.is_platform_isolate {
      task_runners.platform.clone()
    } else {
      task_runners.ui.clone()
    };
    if let Some(runner) = runner {
      let _ = self.message_handling_task_runner.set(runner.clone());
      self
        .message_handler
        .initialize(Arc::new(move |task: Task| runner.post_task(task)));
    }

    vm::set_library_tag_handler(Some(Arc::new(resolve_library_uri)))?;
    vm::set_deferred_load_handler(Some(Arc::new(on_deferred_load)));

    self.transition(Phase::Uninitialized, Phase::Initialized)
  }

  fn load_libraries(&self) -> Result<(), IsolateError> {
    self.expect_phase(Phase::Initialized)?;
    {
      let _scope = self.scope()?;
      vm::set_native_resolver(self.settings.native_resolver.clone())?;
      log::trace!(
        "Isolate {} network policy: insecure={} policy={:?}",
        self.advisory_script_entrypoint(),
        self.may_insecurely_connect_to_all_domains,
        self.domain_network_policy
      );
    }
    self.transition(Phase::Initialized, Phase::LibrariesSetup)
  }

  /// Makes the current runtime isolate runnable. Only valid while the
  /// isolate is current.
  fn mark_isolate_runnable(&self) -> Result<(), IsolateError> {
    self.expect_phase(Phase::LibrariesSetup)?;
    let Some(vm_isolate) = self.vm_isolate.get() else {
      return Err(IsolateError::MakeRunnable("No runtime isolate".to_string()));
    };
    if vm::current_isolate().as_ref() != Some(vm_isolate) {
      return Err(IsolateError::MakeRunnable(
        "The isolate is not current".to_string(),
      ));
    }
    // Nothing may be current while an isolate is made runnable.
    vm::exit_isolate();
    let result = vm::isolate_make_runnable(vm_isolate);
    vm::enter_isolate(vm_isolate);
    result.map_err(|error| {
      log::debug!("{error}");
      IsolateError::MakeRunnable(error)
    })
  }

  fn fire_child_isolate_create_callback(&self) {
    if self.is_root {
      return;
    }
    if let Some(callback) = self.group_data.isolate_create_callback() {
      callback();
    }
  }

  /// Readies an isolate whose program came with the snapshot.
  pub fn prepare_for_running_from_precompiled_code(&self) -> Result<(), IsolateError> {
    self.expect_phase(Phase::LibrariesSetup)?;
    if !vm::is_precompiled_runtime() {
      return Err(IsolateError::NotPrecompiled);
    }
    let _scope = self.scope()?;
    if vm::root_library().is_none() {
      return Err(IsolateError::NoRootLibrary);
    }
    self.mark_isolate_runnable()?;
    if self.group_data.child_isolate_preparer().is_none() {
      self.group_data.set_child_isolate_preparer(Arc::new(|isolate| {
        isolate.prepare_for_running_from_precompiled_code()
      }));
    }
    self.fire_child_isolate_create_callback();
    self.transition(Phase::LibrariesSetup, Phase::Ready)
  }

  /// Loads one piece of a kernel program. Only the `last_piece` call
  /// finalizes loading and readies the isolate.
  ///
  /// Child isolates load nothing when their group already has a program.
  /// Root isolates spawned into an existing group never load.
  pub fn prepare_for_running_from_kernel(
    &self,
    mapping: Option<Arc<dyn Mapping>>,
    child_isolate: bool,
    last_piece: bool,
  ) -> Result<(), IsolateError> {
    self.expect_phase(Phase::LibrariesSetup)?;
    if vm::is_precompiled_runtime() {
      return Err(IsolateError::Precompiled);
    }
    let _scope = self.scope()?;

    let should_load = if child_isolate {
      vm::root_library().is_none()
    } else {
      !self.is_spawning_in_group
    };
    if should_load {
      let Some(mapping) = mapping.filter(|mapping| !mapping.is_empty()) else {
        return Err(IsolateError::InvalidKernel);
      };
      if !child_isolate {
        // The kernel's root library wins over the snapshot's.
        vm::set_root_library(None)?;
      }
      self.load_kernel(mapping, last_piece)?;
    }

    if !last_piece {
      return Ok(());
    }
    if vm::root_library().is_none() {
      return Err(IsolateError::NoRootLibrary);
    }
    self.mark_isolate_runnable()?;

    if self.group_data.child_isolate_preparer().is_none() {
      let buffers = self.group_data.kernel_buffers();
      self
        .group_data
        .set_child_isolate_preparer(Arc::new(move |isolate| {
          if buffers.is_empty() {
            return isolate.prepare_for_running_from_kernel(None, true, true);
          }
          let count = buffers.len();
          for (index, buffer) in buffers.iter().enumerate() {
            isolate.prepare_for_running_from_kernel(
              Some(buffer.clone()),
              true,
              index + 1 == count,
            )?;
          }
          Ok(())
        }));
    }
    self.fire_child_isolate_create_callback();
    self.transition(Phase::LibrariesSetup, Phase::Ready)
  }

  fn load_kernel(
    &self,
    mapping: Arc<dyn Mapping>,
    last_piece: bool,
  ) -> Result<(), IsolateError> {
    if !vm::is_kernel(mapping.as_bytes()) {
      return Err(IsolateError::InvalidKernel);
    }
    // Retained until the group shuts down.
    self.group_data.add_kernel_buffer(mapping.clone());
    let library = vm::load_library_from_kernel(mapping.as_bytes())?;
    if !last_piece {
      return Ok(());
    }
    vm::set_root_library(Some(&library))?;
    vm::finalize_loading()?;
    Ok(())
  }

  /// Schedules `entrypoint` (default `main`) of `library_name` (default the
  /// root library) and moves to [`Phase::Running`].
  pub fn run_from_library(
    &self,
    library_name: Option<&str>,
    entrypoint: Option<&str>,
    args: Vec<String>,
  ) -> Result<(), IsolateError> {
    self.expect_phase(Phase::Ready)?;
    let _scope = self.scope()?;

    let entrypoint = entrypoint
      .filter(|entrypoint| !entrypoint.is_empty())
      .unwrap_or(DEFAULT_ENTRYPOINT);
    let library = match library_name.filter(|name| !name.is_empty()) {
      Some(name) => vm::lookup_library(name).ok(),
      None => vm::root_library(),
    };
    let Some(library) = library else {
      log::error!("Could not resolve main entrypoint function.");
      return Err(IsolateError::EntrypointNotFound(entrypoint.to_string()));
    };
    if let Err(error) = vm::lookup_function(&library, entrypoint) {
      log::error!("Could not resolve main entrypoint function: {error}");
      return Err(IsolateError::EntrypointNotFound(entrypoint.to_string()));
    }
    if let Err(error) = vm::start_main_isolate(&library, entrypoint, args) {
      log::error!("Could not start root isolate: {error}");
      return Err(error.into());
    }

    self.transition(Phase::Ready, Phase::Running)?;
    if self.is_root {
      if let Some(callback) = self.group_data.isolate_create_callback() {
        callback();
      }
    }
    Ok(())
  }

  /// Registers `closure` to run, with the isolate current, while the
  /// isolate shuts down. Each callback fires exactly once.
  pub fn add_isolate_shutdown_callback(&self, closure: impl FnOnce() + Send + 'static) {
    self
      .shutdown_callbacks
      .lock()
      .push(AutoFireClosure::new(closure));
  }

  /// Shuts the isolate down. Calling this a second time is an error.
  ///
  /// Root isolates must be shut down from their UI task runner, with no
  /// isolate current.
  pub fn shutdown(&self) -> Result<(), IsolateError> {
    if self.phase() == Phase::Shutdown
      || self.is_shutting_down.swap(true, Ordering::SeqCst)
    {
      return Err(IsolateError::AlreadyShutdown);
    }
    if self.is_root {
      debug_assert!(
        self
          .context
          .task_runners
          .ui
          .as_ref()
          .is_none_or(|ui| ui.runs_tasks_on_current_thread()),
        "Root isolates must be shut down on their UI task runner"
      );
    }
    debug_assert!(
      vm::current_isolate().is_none(),
      "Isolates must be shut down with no isolate current"
    );
    if let Some(vm_isolate) = self.vm_isolate.get() {
      if !vm_isolate.is_shut_down() {
        let _scope = IsolateScope::new(vm_isolate);
        vm::shutdown_isolate();
      }
    }
    *self.phase.lock() = Phase::Shutdown;
    Ok(())
  }

  /// Called by the runtime while the isolate shuts down. The isolate is
  /// current.
  pub(crate) fn on_shutdown_callback(&self) {
    self.is_shutting_down.store(true, Ordering::SeqCst);
    if let (Some(manager), Some(vm_isolate)) =
      (&self.platform_isolate_manager, self.vm_isolate.get())
    {
      if self.platform_isolate_registered.load(Ordering::SeqCst) {
        manager.remove_platform_isolate(vm_isolate);
      }
    }
    let callbacks = std::mem::take(&mut *self.shutdown_callbacks.lock());
    drop(callbacks);
    if let Some(callback) = self.group_data.isolate_shutdown_callback() {
      callback();
    }
    *self.phase.lock() = Phase::Shutdown;
  }

  /// Completes the pending deferred load of `loading_unit_id`. An invalid
  /// unit fails the load with an error the program can observe.
  pub fn load_loading_unit(
    &self,
    loading_unit_id: i64,
    snapshot_data: Arc<dyn Mapping>,
    snapshot_instructions: Option<Arc<dyn Mapping>>,
  ) -> Result<(), IsolateError> {
    let _scope = self.scope()?;
    let snapshot = Snapshot::new(Some(snapshot_data), snapshot_instructions);
    let instructions = snapshot
      .instructions_mapping()
      .map(|mapping| mapping.as_bytes())
      .unwrap_or_default();
    if let Err(error) =
      vm::deferred_load_complete(loading_unit_id, snapshot.data(), instructions)
    {
      self.load_loading_unit_error(loading_unit_id, &error.message, true);
      return Err(IsolateError::InvalidLoadingUnit(loading_unit_id));
    }
    self.loading_unit_snapshots.lock().push(snapshot);
    Ok(())
  }

  pub fn load_loading_unit_error(
    &self,
    loading_unit_id: i64,
    error_message: &str,
    transient: bool,
  ) {
    let _scope = match self.scope() {
      Ok(scope) => scope,
      Err(error) => {
        log::error!("Cannot fail loading unit {loading_unit_id}: {error}");
        return;
      }
    };
    if let Err(error) =
      vm::deferred_load_complete_error(loading_unit_id, error_message, transient)
    {
      log::error!("{error}");
    }
  }

  /// Creates an isolate in this isolate's group that runs `entry_point` on
  /// the platform task runner.
  ///
  /// Returns `Ok(None)` when the platform isolate manager has already shut
  /// down; the engine is going away and there is nothing to report.
  pub fn create_platform_isolate(
    &self,
    entry_point: NativeFunction,
  ) -> Result<Option<VmIsolate>, IsolateError> {
    let Some(platform_configuration) = &self.platform_configuration else {
      return Err(IsolateError::Create(
        "Platform isolates need a root isolate with a platform configuration"
          .to_string(),
      ));
    };
    let manager = platform_configuration.platform_isolate_manager();
    if manager.has_shutdown_maybe_false_negative() {
      log::info!("create_platform_isolate called after shutdown");
      return Ok(None);
    }
    let Some(platform_runner) = self.context.task_runners.platform.clone() else {
      return Err(IsolateError::Create("No platform task runner".to_string()));
    };
    let Some(parent) = self.vm_isolate.get().cloned() else {
      return Err(IsolateError::WrongPhase {
        expected: Phase::Running,
        actual: self.phase(),
      });
    };

    let parent_was_current = vm::current_isolate().as_ref() == Some(&parent);
    if parent_was_current {
      vm::exit_isolate();
    }

    let mut settings = self.group_data.settings().clone();
    settings.unhandled_exception_callback =
      Some(Arc::new(|error: &str, stack_trace: &str| {
        log::error!("Unhandled exception:\n{error}\n{stack_trace}");
        true
      }));
    let context = IsolateContext {
      task_runners: self.context.task_runners.clone(),
      advisory_script_uri: self.group_data.advisory_script_uri().to_string(),
      advisory_script_entrypoint: self
        .group_data
        .advisory_script_entrypoint()
        .to_string(),
    };
    let isolate = Arc::new(Isolate::new(
      settings,
      self.group_data.clone(),
      context,
      IsolateKind::Platform {
        manager: manager.clone(),
      },
    ));
    let created = create_vm_isolate(&isolate, |data| {
      vm::create_isolate_in_group(
        &parent,
        "PlatformIsolate",
        IsolateHooks::default(),
        Some(data),
      )
    });

    if parent_was_current {
      vm::enter_isolate(&parent);
    }
    let platform_isolate = created?;

    if !manager.register_platform_isolate(&platform_isolate) {
      // The manager shut down while the isolate was being created.
      log::info!("create_platform_isolate called after shutdown");
      let _scope = IsolateScope::new(&platform_isolate);
      vm::shutdown_isolate();
      return Ok(None);
    }
    isolate
      .platform_isolate_registered
      .store(true, Ordering::SeqCst);

    let weak_manager = Arc::downgrade(&manager);
    let weak_isolate = Arc::downgrade(&isolate);
    platform_runner.post_task(Box::new(move || {
      let Some(manager) = weak_manager.upgrade() else {
        return;
      };
      if manager.has_shutdown() {
        return;
      }
      let Some(isolate) = weak_isolate.upgrade() else {
        return;
      };
      let Some(vm_isolate) = isolate.vm_isolate().cloned() else {
        return;
      };
      if vm_isolate.is_shut_down() {
        return;
      }
      let _scope = IsolateScope::new(&vm_isolate);
      match vm::invoke_native(|scope| entry_point(scope, &[])) {
        Ok(()) => {}
        Err(error) if error.is_fatal() => vm::shutdown_isolate(),
        Err(error) => {
          isolate.report_unhandled_exception(
            &error.message,
            error.stack_trace.as_deref().unwrap_or_default(),
          );
        }
      }
    }));

    Ok(Some(platform_isolate))
  }

  /// Offers an unhandled exception to the platform configuration, then to
  /// the settings' callback, and logs it if neither handled it.
  pub fn report_unhandled_exception(&self, error: &str, stack_trace: &str) -> bool {
    if let Some(platform_configuration) = &self.platform_configuration {
      if platform_configuration.on_error(error, stack_trace) {
        return true;
      }
    }
    if let Some(callback) = &self.settings.unhandled_exception_callback {
      if callback(error, stack_trace) {
        return true;
      }
    }
    log::error!("Unhandled Exception: {error}\n{stack_trace}");
    false
  }
}

impl fmt::Debug for Isolate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Isolate")
      .field("advisory_script_uri", &self.context.advisory_script_uri)
      .field("phase", &self.phase())
      .field("is_root", &self.is_root)
      .field("is_platform_isolate", &self.is_platform_isolate)
      .field("vm_isolate", &self.vm_isolate.get())
      .finish_non_exhaustive()
  }
}

/// Creates the runtime isolate for `isolate` with `make_isolate`, which
/// must leave it current, and initializes it. The runtime isolate is not
/// current on return; on failure it has been shut down.
pub(crate) fn create_vm_isolate(
  isolate: &Arc<Isolate>,
  make_isolate: impl FnOnce(IsolateData) -> Result<VmIsolate, String>,
) -> Result<VmIsolate, IsolateError> {
  let data: IsolateData = isolate.clone();
  let vm_isolate = make_isolate(data).map_err(|error| {
    log::error!("Could not create isolate: {error}");
    IsolateError::Create(error)
  })?;
  if let Err(error) = initialize_isolate(isolate, &vm_isolate) {
    vm::shutdown_isolate();
    return Err(error);
  }
  vm::exit_isolate();
  Ok(vm_isolate)
}

/// Takes a freshly created, current runtime isolate to
/// [`Phase::LibrariesSetup`]. Isolates other than roots are also run
/// through their group's child isolate preparer.
pub(crate) fn initialize_isolate(
  isolate: &Isolate,
  vm_isolate: &VmIsolate,
) -> Result<(), IsolateError> {
  if let Err(error) = isolate.initialize(vm_isolate) {
    log::error!("Embedder could not initialize the isolate: {error}");
    return Err(error);
  }
  if let Err(error) = isolate.load_libraries() {
    log::error!("Embedder could not load libraries in the new isolate: {error}");
    return Err(error);
  }
  if !isolate.is_root {
    let Some(preparer) = isolate.group_data.child_isolate_preparer() else {
      log::error!("Could not prepare the child isolate to run: no preparer.");
      return Err(IsolateError::Prepare);
    };
    if let Err(error) = preparer(isolate) {
      log::error!("Could not prepare the child isolate to run: {error}");
      return Err(IsolateError::Prepare);
    }
  }
  Ok(())
}

fn on_deferred_load(loading_unit_id: i64) -> Result<(), VmError> {
  let platform_configuration = Isolate::current()
    .and_then(|isolate| isolate.platform_configuration.clone());
  match platform_configuration {
    Some(platform_configuration) => {
      platform_configuration.request_deferred_library(loading_unit_id);
      Ok(())
    }
    None => {
      let message = format!(
        "Platform Configuration was null. Deferred library load request for loading unit id {loading_unit_id} was not sent."
      );
      log::error!("{message}");
      Err(VmError::api(message))
    }
  }
}

/// Resolves `import` relative to the library that imports it. Absolute
/// URIs and `dart:`/`package:` imports are returned unchanged.
fn resolve_library_uri(library: &str, import: &str) -> Result<String, VmError> {
  if import.contains("://")
    || import.starts_with("dart:")
    || import.starts_with("package:")
  {
    return Ok(import.to_string());
  }
  let (prefix, path) = match library.find("://") {
    Some(index) => library.split_at(index + 3),
    None => ("", library),
  };
  let mut segments: Vec<&str> = match path.rsplit_once('/') {
    Some((directory, _)) => directory.split('/').collect(),
    None => Vec::new(),
  };
  let absolute = path.starts_with('/');
  for segment in import.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        // Never climb above the root.
        if segments.len() > usize::from(absolute) {
          segments.pop();
        } else if !absolute {
          return Err(VmError::api(format!(
            "Import {import} of {library} escapes its root"
          )));
        }
      }
      segment => segments.push(segment),
    }
  }
  Ok(format!("{prefix}{}", segments.join("/")))
}
