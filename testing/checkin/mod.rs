// Copyright 2018-2025 the Deno authors. MIT license.

pub mod runner;
#[cfg(test)]
mod tests;
