// Copyright 2018-2025 the Deno authors. MIT license.

//! Hosts isolates of an embedded managed runtime: VM lifecycle, snapshot
//! resolution, the isolate setup protocol and message dispatch onto
//! embedder task runners.

mod closure;
pub mod error;
mod isolate;
mod mapping;
mod name_server;
mod native_assets;
mod platform_configuration;
mod platform_message;
mod runtime;
mod service_isolate;
mod service_protocol;
mod settings;
mod snapshot;
pub mod tasks;
pub mod vm;

// Re-exports
pub use anyhow;
pub use futures;

pub use crate::closure::AutoFireClosure;
pub use crate::closure::Closure;
pub use crate::closure::ScopedCleanupClosure;
pub use crate::error::AnyError;
pub use crate::error::IsolateError;
pub use crate::error::SnapshotError;
pub use crate::error::VmCreateError;
pub use crate::error::VmError;
pub use crate::error::VmErrorKind;
pub use crate::isolate::AppSnapshotIsolateConfiguration;
pub use crate::isolate::ChildIsolatePreparer;
pub use crate::isolate::Isolate;
pub use crate::isolate::IsolateConfiguration;
pub use crate::isolate::IsolateContext;
pub use crate::isolate::IsolateGroupData;
pub use crate::isolate::IsolateGroupOptions;
pub use crate::isolate::IsolateLaunchType;
pub use crate::isolate::KernelIsolateConfiguration;
pub use crate::isolate::KernelListIsolateConfiguration;
pub use crate::isolate::MessageEpilogue;
pub use crate::isolate::MessageHandler;
pub use crate::isolate::Phase;
pub use crate::isolate::PlatformIsolateManager;
pub use crate::isolate::RootIsolateOptions;
pub use crate::isolate::TaskDispatcher;
pub use crate::isolate::infer_from_settings;
pub use crate::mapping::FileMapping;
pub use crate::mapping::Mapping;
pub use crate::mapping::SymbolMapping;
pub use crate::name_server::IsolateNameServer;
pub use crate::native_assets::NativeAssetsManager;
pub use crate::native_assets::native_assets_target;
pub use crate::platform_configuration::PlatformConfiguration;
pub use crate::platform_message::PlatformMessage;
pub use crate::platform_message::PlatformMessageHandler;
pub use crate::platform_message::PlatformMessageResponse;
pub use crate::runtime::Vm;
pub use crate::runtime::VmData;
pub use crate::runtime::VmRef;
pub use crate::runtime::vm_flags_for_settings;
pub use crate::service_isolate::ServerStatusCallback;
pub use crate::service_isolate::ServiceIsolate;
pub use crate::service_isolate::ServiceOptions;
pub use crate::service_protocol::HandlerDescription;
pub use crate::service_protocol::HandlerId;
pub use crate::service_protocol::LIST_VIEWS_METHOD;
pub use crate::service_protocol::ServiceProtocol;
pub use crate::service_protocol::ServiceProtocolHandler;
pub use crate::settings::IsolateCallback;
pub use crate::settings::KernelPieceFuture;
pub use crate::settings::KernelsProducer;
pub use crate::settings::MappingCallback;
pub use crate::settings::RootIsolateCallback;
pub use crate::settings::Settings;
pub use crate::settings::UnhandledExceptionCallback;
pub use crate::snapshot::Snapshot;
pub use crate::tasks::Task;
pub use crate::tasks::TaskRunner;
pub use crate::tasks::TaskRunners;
