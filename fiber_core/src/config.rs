// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Tunables for the scheduler, collected into one long-lived [`SchedulerConfig`]
//! rather than threaded through every constructor individually.

use std::time::Duration;

/// Configuration handed to [`crate::driver::Driver::new`] (and, through it, to the
/// reactor it owns).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of cleared (but not yet physically removed) waiter slots an
    /// [`crate::promise::Deferred`]'s waiter set tolerates before it compacts
    /// itself. See spec'd waiter-set behavior in `promise::waiter`.
    pub compaction_threshold: usize,

    /// Seed for the deterministic RNG used to break ties in `choose`/`pick`
    /// when multiple inputs are already settled at call time.
    pub choose_seed: u64,

    /// Upper bound the fallback reactor blocks for in a single `poll` call when
    /// there is no sooner timer deadline. Keeps the driver loop responsive to
    /// external wakeups (e.g. `wakeup_later`) even if nothing else is pending.
    pub fallback_reactor_poll_budget: Duration,

    /// Maximum number of times the native reactor's dedicated worker thread is
    /// restarted after an unexpected exit before giving up.
    pub max_worker_restarts: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 42,
            choose_seed: 0x5EED_C0DE_u64,
            fallback_reactor_poll_budget: Duration::from_millis(100),
            max_worker_restarts: 3,
        }
    }
}
