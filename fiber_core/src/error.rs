// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Error types for the scheduler core and its reactor.

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by the promise graph and the driver loop.
#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
    /// [`crate::driver::run`] was called while another call to it was already
    /// in progress. The driver loop is not re-entrant.
    #[error("driver loop is already running")]
    #[diagnostic(
        code(fiber_core::driver_already_running),
        help("call run() to completion (or drop its guard) before calling it again")
    )]
    DriverAlreadyRunning,

    /// A [`crate::promise::Resolver`] was used after its deferred had already
    /// settled (resolved, rejected, or cancelled).
    #[error("deferred was already settled")]
    #[diagnostic(
        code(fiber_core::already_settled),
        help("a resolver may only be used once; check state() before resolving")
    )]
    AlreadySettled,

    /// `nchoose_split`/`npick` or similar was called with an empty list of
    /// deferreds, which has no well-defined winner.
    #[error("combinator requires at least one deferred")]
    #[diagnostic(
        code(fiber_core::empty_combinator_input),
        help("pass at least one deferred to this combinator")
    )]
    EmptyCombinatorInput,

    /// The underlying reactor failed to initialize or poll.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Reactor(#[from] ReactorError),
}

/// Errors raised by a [`crate::reactor::Reactor`] implementation.
#[derive(Debug, Error, Diagnostic)]
pub enum ReactorError {
    /// Failed to construct the OS polling primitive (`mio::Poll::new`, or the
    /// native implementation's worker thread/runtime).
    #[error("failed to initialize reactor: {0}")]
    #[diagnostic(
        code(fiber_core::reactor_init),
        help("this is usually a file-descriptor limit or a sandboxing restriction")
    )]
    Init(#[source] std::io::Error),

    /// A single poll/iterate call failed.
    #[error("reactor poll failed: {0}")]
    #[diagnostic(code(fiber_core::reactor_poll))]
    Poll(#[source] std::io::Error),

    /// Registering a source (fd, signal) with the reactor failed.
    #[error("failed to register source with reactor: {0}")]
    #[diagnostic(code(fiber_core::reactor_register))]
    Register(#[source] std::io::Error),

    /// The dedicated reactor worker thread exited unexpectedly and exhausted
    /// its [`crate::config::SchedulerConfig`] restart budget.
    #[error("reactor worker thread exited after {attempts} restart attempt(s)")]
    #[diagnostic(
        code(fiber_core::reactor_worker_died),
        help("the worker panicked or its channel closed repeatedly; check logs for the panic")
    )]
    WorkerDied { attempts: u8 },
}

pub type CoreResult<T> = Result<T, CoreError>;
pub type ReactorResult<T> = Result<T, ReactorError>;
