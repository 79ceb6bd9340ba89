// Copyright 2018-2025 the Deno authors. MIT license.

mod kernel;
mod messages;
mod root_isolate;
mod service;
mod spawn;
