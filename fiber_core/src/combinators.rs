// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The combinator algebra: ways to build new deferreds out of existing ones without
//! ever blocking the thread they run on.
//!
//! Every combinator here is a thin orchestration layer over
//! [`crate::promise::node`]'s settle/forward/waiter-registration primitives; none of
//! them spawn anything or touch the reactor directly. `choose`/`pick`/`nchoose`'s
//! deterministic tie-breaking uses a seeded `rand_pcg` generator (see
//! [`DeterministicTiebreak`]) rather than `thread_rng`, so replaying the same
//! scheduler config reproduces the same winner when more than one input is already
//! settled at call time.

use std::cell::RefCell;
use std::rc::Rc;

use rand::SeedableRng;
use rand::seq::IteratorRandom as _;
use rand_pcg::Pcg32;

use crate::config::SchedulerConfig;
use crate::error::{CoreError, CoreResult};
use crate::promise::{Context, Deferred, Outcome, capture_current, task, wait, with_context};

/// Chains `f` to run once `input` resolves, producing a new deferred from its
/// result. If `input` rejects or is cancelled, that outcome propagates unchanged and
/// `f` never runs.
#[must_use]
pub fn bind<T, U, E>(
    config: &SchedulerConfig,
    input: &Deferred<T, E>,
    f: impl FnOnce(T) -> Deferred<U, E> + 'static,
) -> Deferred<U, E>
where
    T: Clone + 'static,
    U: 'static,
    E: Clone + 'static,
{
    let (out, resolver) = wait::<U, E>(config);
    let ctx = capture_current();
    input.on_settle(move |outcome| match Rc::unwrap_or_clone(outcome) {
        Outcome::Resolved(value) => {
            let next = with_context(&ctx, || f(value));
            resolver.forward(next);
        }
        Outcome::Rejected(err) => {
            let _ = resolver.reject(err);
        }
        Outcome::Cancelled => drop(resolver),
    });
    out
}

/// Maps a successful resolution through `f`, leaving rejection/cancellation as-is.
#[must_use]
pub fn map<T, U, E>(
    config: &SchedulerConfig,
    input: &Deferred<T, E>,
    f: impl FnOnce(T) -> U + 'static,
) -> Deferred<U, E>
where
    T: Clone + 'static,
    U: 'static,
    E: Clone + 'static,
{
    bind(config, input, move |value| Deferred::resolved(f(value)))
}

/// Recovers from a rejection by running `f`, leaving resolution/cancellation as-is.
#[must_use]
pub fn catch<T, E, F>(
    config: &SchedulerConfig,
    input: &Deferred<T, E>,
    f: impl FnOnce(E) -> Deferred<T, F> + 'static,
) -> Deferred<T, F>
where
    T: Clone + 'static,
    E: Clone + 'static,
    F: 'static,
{
    let (out, resolver) = wait::<T, F>(config);
    let ctx = capture_current();
    input.on_settle(move |outcome| match Rc::unwrap_or_clone(outcome) {
        Outcome::Resolved(value) => {
            let _ = resolver.resolve(value);
        }
        Outcome::Rejected(err) => {
            let next = with_context(&ctx, || f(err));
            resolver.forward(next);
        }
        Outcome::Cancelled => drop(resolver),
    });
    out
}

/// Runs `f` regardless of whether `input` resolves or rejects, passing the outcome
/// through unchanged once `f`'s own returned deferred settles. Cancellation also
/// runs `f` - this is the one combinator every cleanup path can rely on firing.
#[must_use]
pub fn finalize<T, E>(
    config: &SchedulerConfig,
    input: &Deferred<T, E>,
    f: impl FnOnce() -> Deferred<(), E> + 'static,
) -> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    let (out, resolver) = wait::<T, E>(config);
    let ctx = capture_current();
    input.on_settle(move |outcome| {
        let cleanup = with_context(&ctx, f);
        cleanup.on_settle(move |_cleanup_outcome| match Rc::unwrap_or_clone(outcome) {
            Outcome::Resolved(value) => {
                let _ = resolver.resolve(value);
            }
            Outcome::Rejected(err) => {
                let _ = resolver.reject(err);
            }
            Outcome::Cancelled => drop(resolver),
        });
    });
    out
}

/// Like [`bind`], but also given a chance to react to rejection/cancellation -
/// `f` receives the full [`Outcome`] and always produces the next deferred.
#[must_use]
pub fn try_bind<T, U, E>(
    config: &SchedulerConfig,
    input: &Deferred<T, E>,
    f: impl FnOnce(Outcome<T, E>) -> Deferred<U, E> + 'static,
) -> Deferred<U, E>
where
    T: Clone + 'static,
    U: 'static,
    E: Clone + 'static,
{
    let (out, resolver) = wait::<U, E>(config);
    let ctx = capture_current();
    input.on_settle(move |outcome| {
        let owned = Rc::unwrap_or_clone(outcome);
        let next = with_context(&ctx, || f(owned));
        resolver.forward(next);
    });
    out
}

/// Waits for every input to resolve, resolving with `()` once all have. If any input
/// rejects, `join` rejects with that error as soon as it is known - whichever
/// rejection arrives first in time, not first in `inputs`' order - leaving the other
/// inputs to run to completion (`fiber_core` never cancels a sibling implicitly).
///
/// # Errors
///
/// Returns [`CoreError::EmptyCombinatorInput`] if `inputs` is empty.
pub fn join<T, E>(config: &SchedulerConfig, inputs: Vec<Deferred<T, E>>) -> CoreResult<Deferred<(), E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    if inputs.is_empty() {
        return Err(CoreError::EmptyCombinatorInput);
    }
    let (out, resolver) = wait::<(), E>(config);
    let resolver = Rc::new(RefCell::new(Some(resolver)));
    let remaining = Rc::new(RefCell::new(inputs.len()));

    for input in inputs {
        let resolver = resolver.clone();
        let remaining = remaining.clone();
        input.on_settle(move |outcome| match Rc::unwrap_or_clone(outcome) {
            Outcome::Resolved(_) => {
                *remaining.borrow_mut() -= 1;
                if *remaining.borrow() == 0
                    && let Some(resolver) = resolver.borrow_mut().take()
                {
                    let _ = resolver.resolve(());
                }
            }
            Outcome::Rejected(err) => {
                if let Some(resolver) = resolver.borrow_mut().take() {
                    let _ = resolver.reject(err);
                }
            }
            Outcome::Cancelled => {
                resolver.borrow_mut().take();
            }
        });
    }

    Ok(out)
}

/// Deterministic RNG used by `choose`/`pick`/`nchoose` to break ties when more than
/// one input is already settled at call time. Seeded from
/// [`SchedulerConfig::choose_seed`] so a given config always breaks ties the same
/// way, which keeps tests and replay debugging reproducible.
pub(crate) struct DeterministicTiebreak(RefCell<Pcg32>);

impl DeterministicTiebreak {
    fn new(seed: u64) -> Self { Self(RefCell::new(Pcg32::seed_from_u64(seed))) }

    fn pick_index(&self, count: usize) -> usize {
        (0..count)
            .choose(&mut *self.0.borrow_mut())
            .expect("count must be nonzero")
    }
}

fn terminate_others<T, E>(inputs: &[Deferred<T, E>], winner_index: usize) {
    for (i, d) in inputs.iter().enumerate() {
        if i != winner_index {
            d.cancel();
        }
    }
}

/// Resolves or rejects with whichever of `inputs` settles first. Ties among inputs
/// already settled at call time are broken deterministically (see
/// [`DeterministicTiebreak`]). Every losing input is cancelled once a winner is
/// known.
///
/// # Errors
///
/// Returns [`CoreError::EmptyCombinatorInput`] if `inputs` is empty.
pub fn choose<T, E>(
    config: &SchedulerConfig,
    inputs: Vec<Deferred<T, E>>,
) -> CoreResult<Deferred<T, E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    if inputs.is_empty() {
        return Err(CoreError::EmptyCombinatorInput);
    }

    let already_settled: Vec<usize> = inputs
        .iter()
        .enumerate()
        .filter(|(_, d)| !matches!(d.state(), crate::promise::PromiseState::Pending))
        .map(|(i, _)| i)
        .collect();
    if !already_settled.is_empty() {
        let tiebreak = DeterministicTiebreak::new(config.choose_seed);
        let winner = already_settled[tiebreak.pick_index(already_settled.len())];
        terminate_others(&inputs, winner);
        return Ok(inputs[winner].clone());
    }

    let (out, resolver) = wait::<T, E>(config);
    let resolver = Rc::new(RefCell::new(Some(resolver)));
    let handles: Rc<RefCell<Vec<(Deferred<T, E>, crate::promise::WaiterHandle)>>> =
        Rc::new(RefCell::new(Vec::with_capacity(inputs.len())));

    for input in &inputs {
        let resolver = resolver.clone();
        let handles = handles.clone();
        let registration = input.on_settle_removable(move |outcome| {
            let Some(resolver) = resolver.borrow_mut().take() else {
                return;
            };
            for (rep, handle) in handles.borrow_mut().drain(..) {
                Deferred::unregister(&rep, handle);
            }
            match Rc::unwrap_or_clone(outcome) {
                Outcome::Resolved(value) => {
                    let _ = resolver.resolve(value);
                }
                Outcome::Rejected(err) => {
                    let _ = resolver.reject(err);
                }
                Outcome::Cancelled => {}
            }
        });
        if let Some(entry) = registration {
            handles.borrow_mut().push(entry);
        }
    }

    // Every input settled synchronously during registration above (already-settled
    // case was handled earlier, so this only fires if one resolved mid-loop); cancel
    // the rest once the dust has settled.
    let inputs_for_cleanup = inputs.clone();
    out.on_settle(move |_outcome| {
        for input in &inputs_for_cleanup {
            if input.state() == crate::promise::PromiseState::Pending {
                input.cancel();
            }
        }
    });

    Ok(out)
}

/// Like [`choose`], but returns the index of the winning input alongside its
/// outcome, for callers that need to know which branch fired.
///
/// # Errors
///
/// Returns [`CoreError::EmptyCombinatorInput`] if `inputs` is empty.
pub fn pick<T, E>(
    config: &SchedulerConfig,
    inputs: Vec<Deferred<T, E>>,
) -> CoreResult<Deferred<(usize, T), E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    if inputs.is_empty() {
        return Err(CoreError::EmptyCombinatorInput);
    }
    let tagged: Vec<Deferred<(usize, T), E>> = inputs
        .iter()
        .enumerate()
        .map(|(i, d)| map(config, d, move |v| (i, v)))
        .collect();
    choose(config, tagged)
}

/// Resolves once every one of `inputs` has resolved or rejected (never cancelled
/// implicitly, matching `join`'s sibling semantics), with each slot holding its
/// [`Outcome`]. Rejects as a whole as soon as any input rejects.
///
/// # Errors
///
/// Returns [`CoreError::EmptyCombinatorInput`] if `inputs` is empty.
pub fn nchoose<T, E>(
    config: &SchedulerConfig,
    inputs: Vec<Deferred<T, E>>,
) -> CoreResult<Deferred<Vec<T>, E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    if inputs.is_empty() {
        return Err(CoreError::EmptyCombinatorInput);
    }
    let count = inputs.len();
    let (out, resolver) = wait::<Vec<T>, E>(config);
    let resolver = Rc::new(RefCell::new(Some(resolver)));
    let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new((0..count).map(|_| None).collect()));
    let remaining = Rc::new(RefCell::new(count));

    for (i, input) in inputs.into_iter().enumerate() {
        let resolver = resolver.clone();
        let slots = slots.clone();
        let remaining = remaining.clone();
        input.on_settle(move |outcome| match Rc::unwrap_or_clone(outcome) {
            Outcome::Resolved(value) => {
                slots.borrow_mut()[i] = Some(value);
                *remaining.borrow_mut() -= 1;
                if *remaining.borrow() == 0
                    && let Some(resolver) = resolver.borrow_mut().take()
                {
                    let values = slots
                        .borrow_mut()
                        .iter_mut()
                        .map(|slot| slot.take().expect("all slots filled when remaining hits 0"))
                        .collect();
                    let _ = resolver.resolve(values);
                }
            }
            Outcome::Rejected(err) => {
                if let Some(resolver) = resolver.borrow_mut().take() {
                    let _ = resolver.reject(err);
                }
            }
            Outcome::Cancelled => {
                resolver.borrow_mut().take();
            }
        });
    }

    Ok(out)
}

/// Like [`nchoose`] combined with [`pick`]: resolves with the first resolution among
/// `inputs` plus its index, but - unlike `pick` - does not cancel the remaining
/// inputs, which keep running and can be observed independently by the caller.
///
/// # Errors
///
/// Returns [`CoreError::EmptyCombinatorInput`] if `inputs` is empty.
pub fn npick<T, E>(
    config: &SchedulerConfig,
    inputs: Vec<Deferred<T, E>>,
) -> CoreResult<Deferred<(usize, T), E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    if inputs.is_empty() {
        return Err(CoreError::EmptyCombinatorInput);
    }
    let (out, resolver) = wait::<(usize, T), E>(config);
    let resolver = Rc::new(RefCell::new(Some(resolver)));
    for (i, input) in inputs.into_iter().enumerate() {
        let resolver = resolver.clone();
        input.on_settle(move |outcome| {
            let Some(resolver) = resolver.borrow_mut().take() else {
                return;
            };
            match Rc::unwrap_or_clone(outcome) {
                Outcome::Resolved(value) => {
                    let _ = resolver.resolve((i, value));
                }
                Outcome::Rejected(err) => {
                    let _ = resolver.reject(err);
                }
                Outcome::Cancelled => {}
            }
        });
    }
    Ok(out)
}

/// Splits `inputs` into the deferred that settles first and the remainder, so a
/// caller can `npick`/`nchoose` again over what's left. The returned remainder
/// deferreds are the original inputs, unmodified - none are cancelled.
///
/// # Errors
///
/// Returns [`CoreError::EmptyCombinatorInput`] if `inputs` is empty.
pub fn nchoose_split<T, E>(
    config: &SchedulerConfig,
    inputs: Vec<Deferred<T, E>>,
) -> CoreResult<Deferred<(T, Vec<Deferred<T, E>>), E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    if inputs.is_empty() {
        return Err(CoreError::EmptyCombinatorInput);
    }
    let (out, resolver) = wait::<(T, Vec<Deferred<T, E>>), E>(config);
    let resolver = Rc::new(RefCell::new(Some(resolver)));
    for (i, input) in inputs.iter().enumerate() {
        let resolver = resolver.clone();
        let rest: Vec<Deferred<T, E>> = inputs
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, d)| d.clone())
            .collect();
        input.on_settle(move |outcome| {
            let Some(resolver) = resolver.borrow_mut().take() else {
                return;
            };
            match Rc::unwrap_or_clone(outcome) {
                Outcome::Resolved(value) => {
                    let _ = resolver.resolve((value, rest));
                }
                Outcome::Rejected(err) => {
                    let _ = resolver.reject(err);
                }
                Outcome::Cancelled => {}
            }
        });
    }
    Ok(out)
}

/// Wraps `input` so that cancelling the returned deferred does not propagate a
/// cancel request back to `input` - useful for sharing one long-lived operation's
/// result among several independent observers, any of which may lose interest
/// without affecting the others.
#[must_use]
pub fn protected<T: Clone + 'static, E: Clone + 'static>(
    config: &SchedulerConfig,
    input: &Deferred<T, E>,
) -> Deferred<T, E> {
    let (out, resolver) = wait::<T, E>(config);
    let resolver = Rc::new(RefCell::new(Some(resolver)));
    input.on_settle(move |outcome| {
        if let Some(resolver) = resolver.borrow_mut().take() {
            match Rc::unwrap_or_clone(outcome) {
                Outcome::Resolved(value) => {
                    let _ = resolver.resolve(value);
                }
                Outcome::Rejected(err) => {
                    let _ = resolver.reject(err);
                }
                Outcome::Cancelled => {}
            }
        }
    });
    out
}

/// A deferred that resolves the next time the driver loop drains its paused queue,
/// with no other work attached - the cooperative-yield primitive. Constructed by
/// [`crate::driver::Driver::pause`], not directly: yielding only makes sense
/// relative to a specific running driver's paused queue.
pub type Pause = Deferred<(), std::convert::Infallible>;

/// Context key combinator: runs `f` with `value` bound to `key` for the duration of
/// evaluating `f`, restoring whatever was bound before on return. Unlike `bind`'s
/// context capture-at-registration behavior, this binds for direct synchronous
/// execution - used to set up a scope before kicking off asynchronous work.
pub fn with_value<T: 'static, R>(ctx: &Context, key: crate::promise::Key<T>, value: T, f: impl FnOnce() -> R) -> R {
    let extended = ctx.with_value(key, value);
    with_context(&extended, f)
}

/// Constructs a task-backed deferred for representing a unit of externally driven
/// cooperative work, paired with the cancellation hook that stops it. Thin
/// forwarding to [`task`] kept here so combinator call sites don't need to import
/// both `crate::combinators` and `crate::promise`.
#[must_use]
pub fn spawn_task<T: 'static, E: 'static>(
    config: &SchedulerConfig,
    on_cancel: impl Fn() + 'static,
) -> (Deferred<T, E>, crate::promise::Resolver<T, E>) {
    task(config, on_cancel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SchedulerConfig { SchedulerConfig::default() }

    #[test]
    fn bind_chains_resolution() {
        let config = cfg();
        let (d, r): (Deferred<i32, ()>, _) = wait(&config);
        let chained = bind(&config, &d, |v| Deferred::resolved(v + 1));
        r.resolve(1).unwrap();
        assert_eq!(chained.state(), crate::promise::PromiseState::Resolved);
    }

    #[test]
    fn bind_propagates_rejection_without_running_callback() {
        let config = cfg();
        let ran = Rc::new(RefCell::new(false));
        let ran_clone = ran.clone();
        let input: Deferred<i32, &str> = Deferred::rejected("boom");
        let chained = bind(&config, &input, move |v| {
            *ran_clone.borrow_mut() = true;
            Deferred::resolved(v)
        });
        assert!(!*ran.borrow());
        assert_eq!(chained.state(), crate::promise::PromiseState::Rejected);
    }

    #[test]
    fn map_transforms_resolved_value() {
        let config = cfg();
        let input: Deferred<i32, ()> = Deferred::resolved(2);
        let mapped = map(&config, &input, |v| v * 10);
        assert_eq!(mapped.state(), crate::promise::PromiseState::Resolved);
    }

    #[test]
    fn catch_recovers_from_rejection() {
        let config = cfg();
        let input: Deferred<i32, &str> = Deferred::rejected("oops");
        let recovered = catch(&config, &input, |_e| Deferred::resolved(0));
        assert_eq!(recovered.state(), crate::promise::PromiseState::Resolved);
    }

    #[test]
    fn join_waits_for_every_input() {
        let config = cfg();
        let (a, ra): (Deferred<i32, ()>, _) = wait(&config);
        let (b, rb): (Deferred<i32, ()>, _) = wait(&config);
        let joined = join(&config, vec![a, b]).unwrap();
        ra.resolve(1).unwrap();
        assert_eq!(joined.state(), crate::promise::PromiseState::Pending);
        rb.resolve(2).unwrap();
        assert_eq!(joined.state(), crate::promise::PromiseState::Resolved);
    }

    #[test]
    fn join_rejects_as_soon_as_either_side_rejects() {
        let config = cfg();
        let (a, ra): (Deferred<i32, &str>, _) = wait(&config);
        let (b, _rb): (Deferred<i32, &str>, _) = wait(&config);
        let joined = join(&config, vec![a, b]).unwrap();
        ra.reject("bad").unwrap();
        assert_eq!(joined.state(), crate::promise::PromiseState::Rejected);
    }

    #[test]
    fn join_rejects_empty_input() {
        let config = cfg();
        let result: CoreResult<Deferred<(), ()>> = join(&config, vec![]);
        assert!(matches!(result, Err(CoreError::EmptyCombinatorInput)));
    }

    #[test]
    fn choose_rejects_empty_input() {
        let config = cfg();
        let result: CoreResult<Deferred<i32, ()>> = choose(&config, vec![]);
        assert!(matches!(result, Err(CoreError::EmptyCombinatorInput)));
    }

    #[test]
    fn choose_picks_first_settled_and_cancels_the_rest() {
        let config = cfg();
        let (slow, _r_slow): (Deferred<i32, ()>, _) = wait(&config);
        let fast: Deferred<i32, ()> = Deferred::resolved(42);
        let winner = choose(&config, vec![slow.clone(), fast]).unwrap();
        assert_eq!(winner.state(), crate::promise::PromiseState::Resolved);
        assert_eq!(slow.state(), crate::promise::PromiseState::Cancelled);
    }

    #[test]
    fn choose_with_all_pending_resolves_on_first_settle() {
        let config = cfg();
        let (a, ra): (Deferred<i32, ()>, _) = wait(&config);
        let (b, _rb): (Deferred<i32, ()>, _) = wait(&config);
        let winner = choose(&config, vec![a.clone(), b.clone()]).unwrap();
        ra.resolve(7).unwrap();
        assert_eq!(winner.state(), crate::promise::PromiseState::Resolved);
        assert_eq!(b.state(), crate::promise::PromiseState::Cancelled);
    }

    #[test]
    fn pick_reports_winning_index() {
        let config = cfg();
        let a: Deferred<i32, ()> = Deferred::resolved(9);
        let (b, _rb): (Deferred<i32, ()>, _) = wait(&config);
        let result = pick(&config, vec![a, b]).unwrap();
        assert_eq!(result.state(), crate::promise::PromiseState::Resolved);
    }

    #[test]
    fn nchoose_collects_all_in_order() {
        let config = cfg();
        let (a, ra): (Deferred<i32, ()>, _) = wait(&config);
        let (b, rb): (Deferred<i32, ()>, _) = wait(&config);
        let all = nchoose(&config, vec![a, b]).unwrap();
        rb.resolve(2).unwrap();
        assert_eq!(all.state(), crate::promise::PromiseState::Pending);
        ra.resolve(1).unwrap();
        assert_eq!(all.state(), crate::promise::PromiseState::Resolved);
    }

    #[test]
    fn nchoose_rejects_on_first_rejection_even_with_prior_resolutions() {
        let config = cfg();
        let (a, ra): (Deferred<i32, &str>, _) = wait(&config);
        let (b, rb): (Deferred<i32, &str>, _) = wait(&config);
        let all = nchoose(&config, vec![a, b]).unwrap();
        ra.resolve(1).unwrap();
        rb.reject("bad").unwrap();
        assert_eq!(all.state(), crate::promise::PromiseState::Rejected);
    }

    #[test]
    fn npick_does_not_cancel_the_losers() {
        let config = cfg();
        let (a, ra): (Deferred<i32, ()>, _) = wait(&config);
        let (b, _rb): (Deferred<i32, ()>, _) = wait(&config);
        let result = npick(&config, vec![a, b.clone()]).unwrap();
        ra.resolve(5).unwrap();
        assert_eq!(result.state(), crate::promise::PromiseState::Resolved);
        assert_eq!(b.state(), crate::promise::PromiseState::Pending);
    }

    #[test]
    fn protected_does_not_propagate_cancel_upstream() {
        let config = cfg();
        let cancelled = Rc::new(RefCell::new(false));
        let cancelled_clone = cancelled.clone();
        let (input, _resolver) = task::<i32, ()>(&config, move || *cancelled_clone.borrow_mut() = true);
        let guarded = protected(&config, &input);
        guarded.cancel();
        assert!(!*cancelled.borrow());
    }
}
