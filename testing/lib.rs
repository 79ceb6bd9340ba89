// Copyright 2018-2025 the Deno authors. MIT license.

//! Fixtures for driving `isolate_host` end to end: snapshot and kernel
//! blobs, a native registry that records what the program did, and the
//! threads an embedder would run isolates on.

mod checkin;

pub use checkin::runner::Fixture;
pub use checkin::runner::Output;
pub use checkin::runner::TestPlatformConfiguration;
pub use checkin::runner::snapshot::ROOT_LIBRARY;
pub use checkin::runner::snapshot::create_isolate_snapshot;
pub use checkin::runner::snapshot::create_loading_unit;
pub use checkin::runner::snapshot::create_vm_snapshot;
pub use checkin::runner::snapshot::main_kernel;
pub use checkin::runner::thread_host::Latch;
pub use checkin::runner::thread_host::ThreadHost;
pub use checkin::runner::thread_host::post_task_sync;
