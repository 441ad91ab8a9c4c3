// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The main loop: drain paused continuations, poll the reactor, drain anything
//! scheduled via [`Driver::wakeup_later`], repeat until the root deferred settles.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug_span;

use crate::config::SchedulerConfig;
use crate::error::{CoreError, CoreResult};
use crate::promise::{Deferred, Outcome, wait};
use crate::reactor::{Reactor, ReactorEvent, TimerId};

type PausedThunk = Box<dyn FnOnce()>;

thread_local! {
    static RUNNING: Cell<bool> = const { Cell::new(false) };
}

struct DriverRunGuard;

impl DriverRunGuard {
    fn acquire() -> CoreResult<Self> {
        let already_running = RUNNING.with(|r| r.replace(true));
        if already_running {
            return Err(CoreError::DriverAlreadyRunning);
        }
        Ok(Self)
    }
}

impl Drop for DriverRunGuard {
    fn drop(&mut self) { RUNNING.with(|r| r.set(false)); }
}

/// Owns a [`Reactor`] and the queues a single-threaded cooperative run loop drains
/// each iteration. Not re-entrant: calling [`Driver::run`] while another call to it
/// is already on the stack (even via a nested `run` on a *different* `Driver`
/// instance, since the guard is process/thread global) fails fast with
/// [`CoreError::DriverAlreadyRunning`] rather than corrupting either loop's state.
pub struct Driver<R: Reactor> {
    config: SchedulerConfig,
    reactor: R,
    paused: Rc<RefCell<VecDeque<PausedThunk>>>,
    wakeups: Rc<RefCell<VecDeque<PausedThunk>>>,
    pending_timers: Rc<RefCell<Vec<(TimerId, PausedThunk)>>>,
}

impl<R: Reactor> Driver<R> {
    #[must_use]
    pub fn new(config: SchedulerConfig, reactor: R) -> Self {
        Self {
            config,
            reactor,
            paused: Rc::new(RefCell::new(VecDeque::new())),
            wakeups: Rc::new(RefCell::new(VecDeque::new())),
            pending_timers: Rc::new(RefCell::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig { &self.config }

    /// Returns a deferred that resolves the next time this driver's paused queue is
    /// drained - the cooperative-yield primitive. Queues the resolution rather than
    /// firing it immediately, so every currently-running callback gets a chance to
    /// finish before `resolver.resolve` runs.
    #[must_use]
    pub fn pause(&self) -> crate::combinators::Pause {
        let (deferred, resolver) = wait(&self.config);
        self.paused.borrow_mut().push_back(Box::new(move || {
            let _ = resolver.resolve(());
        }));
        deferred
    }

    /// Schedules `f` to run the next time the driver is between iterations, without
    /// waiting for the reactor - used by code outside the driver loop (e.g. a
    /// signal handler, or a `Resolver` held by another thread's completion
    /// notification) to safely hand work back to the single-threaded scheduler.
    pub fn wakeup_later(&self, f: impl FnOnce() + 'static) {
        self.wakeups.borrow_mut().push_back(Box::new(f));
    }

    /// Resolves with `()` once `deadline` has passed, via the reactor's timer
    /// facility.
    #[must_use]
    pub fn sleep_until(&mut self, deadline: Instant) -> Deferred<(), std::convert::Infallible> {
        let (deferred, resolver) = wait(&self.config);
        let timer_id = self.reactor.set_timer(deadline);
        self.pending_timers.borrow_mut().push((
            timer_id,
            Box::new(move || {
                let _ = resolver.resolve(());
            }),
        ));
        deferred
    }

    /// Runs the driver loop until `root` settles, returning its outcome. Each
    /// iteration: drain the paused queue, poll the reactor (blocking only if both
    /// queues are empty and `root` is still pending), then drain the wakeup-later
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DriverAlreadyRunning`] if called re-entrantly, or
    /// [`CoreError::Reactor`] if a reactor poll fails.
    pub fn run<T, E>(&mut self, root: &Deferred<T, E>) -> CoreResult<Rc<Outcome<T, E>>>
    where
        T: 'static,
        E: 'static,
    {
        let _guard = DriverRunGuard::acquire()?;

        let final_outcome: Rc<RefCell<Option<Rc<Outcome<T, E>>>>> = Rc::new(RefCell::new(None));
        let final_outcome_clone = final_outcome.clone();
        root.on_settle(move |outcome| {
            *final_outcome_clone.borrow_mut() = Some(outcome);
        });

        loop {
            let span = debug_span!("driver_iteration");
            let _enter = span.enter();

            self.drain_queue(&self.paused.clone());

            if let Some(outcome) = final_outcome.borrow().clone() {
                return Ok(outcome);
            }

            let should_block = self.paused.borrow().is_empty() && self.wakeups.borrow().is_empty();
            let events = self
                .reactor
                .poll(should_block, self.config.fallback_reactor_poll_budget)?;
            self.dispatch_reactor_events(events);

            self.drain_queue(&self.wakeups.clone());

            if let Some(outcome) = final_outcome.borrow().clone() {
                return Ok(outcome);
            }
        }
    }

    fn drain_queue(&self, queue: &Rc<RefCell<VecDeque<PausedThunk>>>) {
        loop {
            let next = queue.borrow_mut().pop_front();
            match next {
                Some(thunk) => thunk(),
                None => break,
            }
        }
    }

    fn dispatch_reactor_events(&mut self, events: Vec<ReactorEvent>) {
        for event in events {
            if let ReactorEvent::Timer(id) = event {
                let mut timers = self.pending_timers.borrow_mut();
                if let Some(pos) = timers.iter().position(|(t, _)| *t == id) {
                    let (_, thunk) = timers.remove(pos);
                    drop(timers);
                    thunk();
                }
            }
            // ReactorEvent::Io events are consumed by whatever higher-level I/O
            // abstraction registered the source; the driver itself only owns the
            // timer bookkeeping built on top of `Reactor::set_timer`.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::fallback::FallbackReactor;

    #[test]
    fn run_resolves_an_already_settled_root_without_blocking() {
        let config = SchedulerConfig::default();
        let reactor = FallbackReactor::new().unwrap();
        let mut driver = Driver::new(config, reactor);
        let root: Deferred<i32, ()> = Deferred::resolved(42);
        let outcome = driver.run(&root).unwrap();
        assert!(matches!(*outcome, Outcome::Resolved(42)));
    }

    #[test]
    fn pause_resolves_on_the_next_iteration() {
        let config = SchedulerConfig::default();
        let reactor = FallbackReactor::new().unwrap();
        let mut driver = Driver::new(config, reactor);
        let paused = driver.pause();
        let outcome = driver.run(&paused).unwrap();
        assert!(matches!(*outcome, Outcome::Resolved(())));
    }

    #[test]
    fn sleep_until_resolves_once_the_deadline_passes() {
        let config = SchedulerConfig::default();
        let reactor = FallbackReactor::new().unwrap();
        let mut driver = Driver::new(config, reactor);
        let deadline = Instant::now() + Duration::from_millis(10);
        let sleeper = driver.sleep_until(deadline);
        let outcome = driver.run(&sleeper).unwrap();
        assert!(matches!(*outcome, Outcome::Resolved(())));
    }

    #[test]
    fn wakeup_later_runs_between_iterations() {
        let config = SchedulerConfig::default();
        let reactor = FallbackReactor::new().unwrap();
        let mut driver = Driver::new(config, reactor);
        let (root, resolver) = wait::<i32, ()>(&driver.config);
        driver.wakeup_later(move || {
            let _ = resolver.resolve(9);
        });
        let outcome = driver.run(&root).unwrap();
        assert!(matches!(*outcome, Outcome::Resolved(9)));
    }

    #[test]
    fn reentrant_run_is_rejected() {
        let config = SchedulerConfig::default();
        let reactor = FallbackReactor::new().unwrap();
        let mut outer = Driver::new(config.clone(), reactor);
        let (root, resolver) = wait::<i32, ()>(&config);

        let rejected = Rc::new(Cell::new(false));
        let rejected_clone = rejected.clone();
        outer.wakeup_later(move || {
            let inner_reactor = FallbackReactor::new().unwrap();
            let mut inner = Driver::new(SchedulerConfig::default(), inner_reactor);
            let (inner_root, _inner_resolver) = wait::<i32, ()>(&SchedulerConfig::default());
            let result = inner.run(&inner_root);
            rejected_clone.set(matches!(result, Err(CoreError::DriverAlreadyRunning)));
            let _ = resolver.resolve(1);
        });

        let outcome = outer.run(&root).unwrap();
        assert!(matches!(*outcome, Outcome::Resolved(1)));
        assert!(rejected.get());
    }
}
