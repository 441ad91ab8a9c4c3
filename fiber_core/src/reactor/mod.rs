// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The pluggable I/O-readiness/timer reactor the driver loop polls each iteration.
//!
//! Two implementations are provided: [`fallback::FallbackReactor`], a self-contained
//! `mio`-backed epoll/kqueue poller plus a timer min-heap, usable on its own with no
//! other runtime present; and [`native::NativeReactor`], which offloads the actual
//! blocking wait onto a dedicated worker thread (the Resilient Reactor Thread
//! pattern) so the calling thread never blocks in a syscall itself. Both satisfy the
//! same ordering guarantee: within one [`Reactor::poll`] call, due timers are
//! reported before fd readiness events, readable-before-writable within one fd's
//! event, and fd events otherwise in registration order.

pub mod fallback;
pub mod native;

use std::time::{Duration, Instant};

use crate::error::ReactorResult;

/// Identifies one registered I/O source across calls to a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// Identifies one scheduled timer across calls to a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Which readiness a registration cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

/// One thing a [`Reactor::poll`] call noticed.
#[derive(Debug, Clone, Copy)]
pub enum ReactorEvent {
    /// A previously scheduled timer's deadline has passed.
    Timer(TimerId),
    /// A registered source became ready.
    Io {
        token: Token,
        readable: bool,
        writable: bool,
    },
}

/// A pluggable source of readiness/timer events.
///
/// Implementations are not required to be `Send`/`Sync` - the driver loop that owns
/// one runs entirely on a single thread (see [`crate::driver`]), consistent with this
/// crate's cooperative, non-preemptive scheduling model.
pub trait Reactor {
    /// Registers a raw fd-backed source for readiness notifications.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ReactorError::Register`] if the underlying OS
    /// registration call fails.
    fn register(
        &mut self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Interest,
    ) -> ReactorResult<()>;

    /// Removes a previously registered source.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ReactorError::Register`] if the underlying OS
    /// deregistration call fails.
    fn deregister(&mut self, source: &mut dyn mio::event::Source) -> ReactorResult<()>;

    /// Schedules a timer event for `deadline`, returning an id that later appears in
    /// a [`ReactorEvent::Timer`].
    fn set_timer(&mut self, deadline: Instant) -> TimerId;

    /// Cancels a previously scheduled timer. A no-op if it already fired or was
    /// already cancelled.
    fn cancel_timer(&mut self, id: TimerId);

    /// Waits for events, for at most `budget` if `block` is true and nothing is due
    /// sooner, or returns immediately with whatever is already ready if `block` is
    /// false.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ReactorError::Poll`] if the underlying OS poll call
    /// fails.
    fn poll(&mut self, block: bool, budget: Duration) -> ReactorResult<Vec<ReactorEvent>>;
}
