// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! A self-contained reactor: `mio`'s cross-platform readiness multiplexing (epoll on
//! Linux, kqueue on macOS) plus a timer min-heap, usable with no other async runtime
//! present. This is the reactor [`crate::driver::Driver`] constructs by default.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use mio::{Events, Poll};

use super::{Interest, Reactor, ReactorEvent, Token, TimerId};
use crate::error::{ReactorError, ReactorResult};

/// Token reserved for the unix signal wake source registered by
/// [`FallbackReactor::watch_unix_signals`]. Chosen far from low, densely-used token
/// values so embedding applications registering their own fds at small indices don't
/// collide with it.
#[cfg(unix)]
pub const SIGNAL_WAKE_TOKEN: Token = Token(usize::MAX - 1);

#[derive(PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        Reverse((self.deadline, self.seq)).cmp(&Reverse((other.deadline, other.seq)))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

/// `mio`-backed reactor for when nothing else is already driving an OS event loop.
pub struct FallbackReactor {
    poll: Poll,
    events: Events,
    timers: BinaryHeap<TimerEntry>,
    cancelled: HashSet<u64>,
    next_timer_seq: u64,
    #[cfg(unix)]
    signals: Option<signal_hook_mio::v1_0::Signals>,
}

impl FallbackReactor {
    /// Creates a new fallback reactor.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Init`] if the underlying `mio::Poll` cannot be
    /// constructed (typically a file-descriptor limit).
    pub fn new() -> ReactorResult<Self> {
        Ok(Self {
            poll: Poll::new().map_err(ReactorError::Init)?,
            events: Events::with_capacity(1024),
            timers: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_timer_seq: 0,
            #[cfg(unix)]
            signals: None,
        })
    }

    /// Registers a wake source for the given unix signal numbers (e.g.
    /// `libc::SIGINT`, `libc::SIGTERM`), reported via [`ReactorEvent::Io`] at
    /// [`SIGNAL_WAKE_TOKEN`]. Call [`FallbackReactor::pending_signals`] after such an
    /// event to drain the actual signal numbers that arrived.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Register`] if installing the signal handler or
    /// registering its wake fd fails.
    #[cfg(unix)]
    pub fn watch_unix_signals(&mut self, signal_numbers: &[std::ffi::c_int]) -> ReactorResult<()> {
        let mut signals =
            signal_hook_mio::v1_0::Signals::new(signal_numbers.iter().copied()).map_err(ReactorError::Register)?;
        self.poll
            .registry()
            .register(&mut signals, mio::Token(SIGNAL_WAKE_TOKEN.0), mio::Interest::READABLE)
            .map_err(ReactorError::Register)?;
        self.signals = Some(signals);
        Ok(())
    }

    /// Drains the unix signal numbers that triggered a [`SIGNAL_WAKE_TOKEN`] event.
    /// Returns an empty `Vec` if [`FallbackReactor::watch_unix_signals`] was never
    /// called.
    #[cfg(unix)]
    pub fn pending_signals(&mut self) -> Vec<std::ffi::c_int> {
        match &mut self.signals {
            Some(signals) => signals.pending().collect(),
            None => Vec::new(),
        }
    }

    fn pop_due_timers(&mut self, now: Instant, out: &mut Vec<ReactorEvent>) {
        while let Some(top) = self.timers.peek() {
            if self.cancelled.remove(&top.seq) {
                self.timers.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            let entry = self.timers.pop().expect("peeked Some above");
            out.push(ReactorEvent::Timer(TimerId(entry.seq)));
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .iter()
            .filter(|e| !self.cancelled.contains(&e.seq))
            .map(|e| e.deadline)
            .min()
    }
}

impl Reactor for FallbackReactor {
    fn register(
        &mut self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Interest,
    ) -> ReactorResult<()> {
        let mio_interest = match interest {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
            Interest::Both => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
        };
        self.poll
            .registry()
            .register(source, mio::Token(token.0), mio_interest)
            .map_err(ReactorError::Register)
    }

    fn deregister(&mut self, source: &mut dyn mio::event::Source) -> ReactorResult<()> {
        self.poll.registry().deregister(source).map_err(ReactorError::Register)
    }

    fn set_timer(&mut self, deadline: Instant) -> TimerId {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        self.timers.push(TimerEntry { deadline, seq });
        TimerId(seq)
    }

    fn cancel_timer(&mut self, id: TimerId) { self.cancelled.insert(id.0); }

    fn poll(&mut self, block: bool, budget: Duration) -> ReactorResult<Vec<ReactorEvent>> {
        let now = Instant::now();
        let mut out = Vec::new();
        self.pop_due_timers(now, &mut out);
        if !out.is_empty() {
            // Timers already due: don't block waiting for I/O this iteration, but
            // still give the OS a zero-length poll so ready fds aren't starved.
            self.poll.poll(&mut self.events, Some(Duration::ZERO)).map_err(ReactorError::Poll)?;
            self.drain_io_events(&mut out);
            return Ok(out);
        }

        let wait = match (block, self.next_deadline()) {
            (false, _) => Some(Duration::ZERO),
            (true, Some(deadline)) => Some(deadline.saturating_duration_since(now).min(budget)),
            (true, None) => Some(budget),
        };
        self.poll.poll(&mut self.events, wait).map_err(ReactorError::Poll)?;
        self.pop_due_timers(Instant::now(), &mut out);
        self.drain_io_events(&mut out);
        Ok(out)
    }
}

impl FallbackReactor {
    fn drain_io_events(&self, out: &mut Vec<ReactorEvent>) {
        for event in &self.events {
            out.push(ReactorEvent::Io {
                token: Token(event.token().0),
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order_regardless_of_registration_order() {
        let mut reactor = FallbackReactor::new().unwrap();
        let now = Instant::now();
        let far = reactor.set_timer(now + Duration::from_secs(10));
        let near = reactor.set_timer(now);
        let mut out = Vec::new();
        reactor.pop_due_timers(now + Duration::from_millis(1), &mut out);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], ReactorEvent::Timer(id) if id.0 == near.0));
        assert_ne!(near.0, far.0);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut reactor = FallbackReactor::new().unwrap();
        let now = Instant::now();
        let id = reactor.set_timer(now);
        reactor.cancel_timer(id);
        let mut out = Vec::new();
        reactor.pop_due_timers(now + Duration::from_millis(1), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn poll_non_blocking_returns_immediately_with_no_sources() {
        let mut reactor = FallbackReactor::new().unwrap();
        let events = reactor.poll(false, Duration::from_secs(1)).unwrap();
        assert!(events.is_empty());
    }
}
