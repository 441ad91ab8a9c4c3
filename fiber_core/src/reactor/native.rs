// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! A reactor that offloads the blocking `mio` wait onto a dedicated worker thread,
//! adapted from the Resilient Reactor Thread (RRT) pattern: a worker blocks in
//! `epoll`/`kqueue`, broadcasts readiness batches back over a channel, and is
//! restarted with bounded, backed-off attempts if it ever exits unexpectedly.
//!
//! Registration itself does *not* round-trip through the worker: `mio::Registry`
//! supports concurrent registration from any thread while another thread is blocked
//! in `Poll::poll` on the same instance, so [`NativeReactor::register`] talks
//! directly to a cloned `Registry` handle. Only readiness events and the periodic
//! "did the worker die" check flow through the channel.
//!
//! The timer heap lives on the caller's thread (not the worker's): the worker's poll
//! budget is a short fixed tick rather than "wake exactly at the next deadline",
//! trading a little latency for not needing to push deadline updates across the
//! thread boundary on every `set_timer`/`cancel_timer` call.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry};

use super::{Interest, Reactor, ReactorEvent, Token, TimerId};
use crate::config::SchedulerConfig;
use crate::error::{ReactorError, ReactorResult};

/// Restart behavior applied when the worker thread exits unexpectedly. Defaults
/// mirror a systemd-style service restart directive: a handful of quickly-escalating
/// attempts, then give up.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u8,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    /// Builds a restart policy whose restart budget comes from
    /// [`SchedulerConfig::max_worker_restarts`], keeping the rest of
    /// [`RestartPolicy::default`]'s backoff shape.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_restarts: config.max_worker_restarts,
            ..Self::default()
        }
    }
}

const WORKER_TICK: Duration = Duration::from_millis(50);

#[derive(PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        Reverse((self.deadline, self.seq)).cmp(&Reverse((other.deadline, other.seq)))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

struct Worker {
    handle: JoinHandle<()>,
    events_rx: Receiver<Vec<ReactorEvent>>,
    shutdown: Arc<AtomicBool>,
}

fn spawn_worker() -> std::io::Result<(Worker, Registry)> {
    let poll = Poll::new()?;
    let registry = poll.registry().try_clone()?;
    let (tx, rx): (Sender<Vec<ReactorEvent>>, _) = mpsc::channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let handle = std::thread::Builder::new()
        .name("fiber-core-reactor".into())
        .spawn(move || worker_loop(poll, tx, &shutdown_clone))?;
    Ok((
        Worker {
            handle,
            events_rx: rx,
            shutdown,
        },
        registry,
    ))
}

fn worker_loop(mut poll: Poll, tx: Sender<Vec<ReactorEvent>>, shutdown: &AtomicBool) {
    let mut events = Events::with_capacity(1024);
    while !shutdown.load(Ordering::Relaxed) {
        if poll.poll(&mut events, Some(WORKER_TICK)).is_err() {
            continue;
        }
        let batch: Vec<ReactorEvent> = events
            .iter()
            .map(|event| ReactorEvent::Io {
                token: Token(event.token().0),
                readable: event.is_readable(),
                writable: event.is_writable(),
            })
            .collect();
        if tx.send(batch).is_err() {
            break;
        }
    }
}

/// A reactor whose blocking `epoll`/`kqueue` wait happens on a dedicated thread.
pub struct NativeReactor {
    registry: Registry,
    worker: Worker,
    restart_policy: RestartPolicy,
    restart_attempts: u8,
    timers: BinaryHeap<TimerEntry>,
    cancelled: HashSet<u64>,
    next_timer_seq: u64,
}

impl NativeReactor {
    /// Spawns the worker thread and returns a reactor bound to it.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Init`] if the worker's `mio::Poll` or the OS thread
    /// itself cannot be created.
    pub fn new(restart_policy: RestartPolicy) -> ReactorResult<Self> {
        let (worker, registry) = spawn_worker().map_err(ReactorError::Init)?;
        Ok(Self {
            registry,
            worker,
            restart_policy,
            restart_attempts: 0,
            timers: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_timer_seq: 0,
        })
    }

    fn restart_worker(&mut self) -> ReactorResult<()> {
        if self.restart_attempts >= self.restart_policy.max_restarts {
            return Err(ReactorError::WorkerDied {
                attempts: self.restart_attempts,
            });
        }
        let delay = self.backoff_delay();
        std::thread::sleep(delay);
        let (worker, registry) = spawn_worker().map_err(ReactorError::Init)?;
        self.worker = worker;
        self.registry = registry;
        self.restart_attempts += 1;
        Ok(())
    }

    fn backoff_delay(&self) -> Duration {
        let multiplier = self.restart_policy.backoff_multiplier.powi(i32::from(self.restart_attempts));
        let scaled = self.restart_policy.initial_delay.mul_f64(multiplier);
        scaled.min(self.restart_policy.max_delay)
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

impl Drop for NativeReactor {
    fn drop(&mut self) {
        self.worker.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Reactor for NativeReactor {
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
        self.registry
            .register(source, mio::Token(token.0), mio_interest)
            .map_err(ReactorError::Register)
    }

    fn deregister(&mut self, source: &mut dyn mio::event::Source) -> ReactorResult<()> {
        self.registry.deregister(source).map_err(ReactorError::Register)
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
            return Ok(out);
        }

        let deadline = match (block, self.next_deadline()) {
            (false, _) => now,
            (true, Some(d)) => d.min(now + budget),
            (true, None) => now + budget,
        };

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.worker.events_rx.recv_timeout(wait) {
                Ok(batch) => {
                    out.extend(batch);
                    self.pop_due_timers(Instant::now(), &mut out);
                    return Ok(out);
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.pop_due_timers(Instant::now(), &mut out);
                    return Ok(out);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.restart_worker()?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_without_needing_the_worker_thread() {
        let mut reactor = NativeReactor::new(RestartPolicy::default()).unwrap();
        let now = Instant::now();
        reactor.set_timer(now);
        let events = reactor.poll(true, Duration::from_millis(200)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ReactorEvent::Timer(_)));
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut reactor = NativeReactor::new(RestartPolicy::default()).unwrap();
        let id = reactor.set_timer(Instant::now());
        reactor.cancel_timer(id);
        let events = reactor.poll(false, Duration::ZERO).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn non_blocking_poll_with_no_timers_returns_immediately() {
        let mut reactor = NativeReactor::new(RestartPolicy::default()).unwrap();
        let events = reactor.poll(false, Duration::from_secs(1)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn restart_policy_from_config_carries_the_configured_restart_budget() {
        let config = SchedulerConfig {
            max_worker_restarts: 7,
            ..SchedulerConfig::default()
        };
        let policy = RestartPolicy::from_config(&config);
        assert_eq!(policy.max_restarts, 7);
        assert_eq!(policy.initial_delay, RestartPolicy::default().initial_delay);
    }
}
