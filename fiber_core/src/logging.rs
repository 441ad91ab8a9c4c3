// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Optional `tracing_subscriber` installation helper.
//!
//! This crate never installs a global subscriber on its own - a library that calls
//! `tracing::subscriber::set_global_default` on load hijacks whatever a downstream
//! binary wants to do with its own logs. [`init_global_subscriber`] is offered purely
//! as a convenience for binaries and examples embedding this crate, mirroring the
//! `fmt` + `EnvFilter` shape the teacher's own `tracing_init` used, with the
//! rolling-file-appender and `SharedWriter` indirection dropped since this crate has
//! no sink of its own to route through.

use tracing_subscriber::{EnvFilter, fmt, util::TryInitError};

// `tracing_subscriber::fmt::fmt()` builds a `SubscriberBuilder`; `fmt` above names
// the module, so calls below go through `fmt::fmt()`.

/// The environment variable consulted for the default filter directive, e.g.
/// `FIBER_CORE_LOG=fiber_core=debug`.
pub const LOG_ENV_VAR: &str = "FIBER_CORE_LOG";

/// Installs a global `tracing` subscriber that writes formatted events to stderr,
/// filtered by [`LOG_ENV_VAR`] (defaulting to `warn` if unset or unparsable).
///
/// # Errors
///
/// Returns the underlying error if a global default subscriber has already been
/// installed - this can only succeed once per process.
pub fn init_global_subscriber() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt::fmt().with_env_filter(filter).with_target(true).try_init()
}
