// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Structured logging initialization (ambient stack, §2 "Logging").
//!
//! A single call site shared by `homeostas-server`'s binary and its
//! integration tests, matching the way `hdds-persistence::main` and
//! `hdds-discovery-server::main` each call `tracing_subscriber::fmt()...init()`
//! once at process start. This crate intentionally stops there: the
//! teacher's own `hdds-logger` is a standalone aggregation service with
//! collectors, filters, and output sinks, which is far more than the
//! "structured logging sink" this workspace's ambient stack calls for.

use tracing_subscriber::EnvFilter;

/// Default level when `RUST_LOG` is unset, mirroring
/// `hdds-persistence::main`'s `Level::INFO` default directive.
pub const DEFAULT_LEVEL: tracing::Level = tracing::Level::INFO;

/// Initialize the global `tracing` subscriber for a foreground binary.
///
/// Safe to call at most once per process; a second call is a logic error in
/// the caller, not something this function guards against, matching the
/// teacher's bare `tracing_subscriber::fmt()...init()` call sites.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(DEFAULT_LEVEL.into()))
        .init();
}

/// Variant of [`init`] for tests: never panics if a subscriber is already
/// installed (parallel test binaries racing to init the same process-global
/// subscriber), matching the `let _ = ...` idiom the teacher's test helpers
/// use around one-shot global initialization.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(DEFAULT_LEVEL.into()))
        .with_test_writer()
        .try_init();
}
