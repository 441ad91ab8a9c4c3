// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The shared, interior-mutable node backing a [`crate::promise::Deferred`].
//!
//! Nodes form union-find-style forwarding chains: when a deferred is bound to adopt
//! another deferred's eventual outcome (the common case when a `bind` callback
//! returns a fresh promise), rather than copying state around, the first node's slot
//! becomes a [`State::Forward`] pointer at the second. [`find_root`] walks and
//! compresses these chains the same way a union-find `find` does, so looking up or
//! settling a long-forwarded chain stays close to O(1) amortized instead of O(n).
//!
//! A node's callbacks are never invoked while any [`RefCell`] borrow on it is held -
//! every settle/forward path extracts the waiter set by value out of a short-lived
//! `borrow_mut()` block, lets that borrow drop, and only then calls into user code.
//! Skipping this would panic the first time a self-resolving callback (a cancel
//! thunk that settles its own deferred, or a waiter that registers another waiter on
//! the same node) tried to re-borrow.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::waiter::{WaiterHandle, WaiterSet};

/// The terminal result of a deferred computation.
///
/// `Clone` requires `T: Clone, E: Clone` because a settled node keeps its `Outcome`
/// around indefinitely (for late `state()`/registration queries and for fan-out to
/// however many waiters are attached), so no single waiter can assume it is the sole
/// owner of the shared `Rc` - see [`Rc::unwrap_or_clone`] at each call site, which
/// moves out when it happens to be the last reference and clones otherwise.
#[derive(Clone)]
pub enum Outcome<T, E> {
    Resolved(T),
    Rejected(E),
    Cancelled,
}

impl<T, E> Outcome<T, E> {
    #[must_use]
    pub fn is_cancelled(&self) -> bool { matches!(self, Outcome::Cancelled) }
}

/// A type-erased callback invoked once when a node's outcome becomes available.
/// Outcomes are shared via `Rc` rather than handed over by value, since more than
/// one waiter (every sibling in a `join`, every loser in a `choose`) may need to
/// observe the same settled value.
pub type Waiter<T, E> = Box<dyn FnOnce(Rc<Outcome<T, E>>)>;

/// A shared handle used to request cancellation of whatever produced a pending
/// node's value. Invoking it more than once, or after the node has settled, is a
/// silent no-op by construction: callers only ever reach it through
/// [`super::deferred::Deferred::cancel`], which checks the node's state first.
#[derive(Clone)]
pub struct CancelHandle(Rc<dyn Fn()>);

impl CancelHandle {
    pub fn new(f: impl Fn() + 'static) -> Self { Self(Rc::new(f)) }

    pub fn invoke(&self) { (self.0)(); }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("CancelHandle(..)") }
}

pub(crate) struct PendingState<T, E> {
    pub waiters: WaiterSet<Waiter<T, E>>,
    pub cancel: Option<CancelHandle>,
}

pub(crate) enum State<T, E> {
    Pending(PendingState<T, E>),
    Settled(Rc<Outcome<T, E>>),
    Forward(NodeRef<T, E>),
}

pub(crate) struct Node<T, E> {
    pub state: State<T, E>,
}

pub type NodeRef<T, E> = Rc<RefCell<Node<T, E>>>;

pub(crate) fn new_pending_node<T, E>(
    compaction_threshold: usize,
    cancel: Option<CancelHandle>,
) -> NodeRef<T, E> {
    Rc::new(RefCell::new(Node {
        state: State::Pending(PendingState {
            waiters: WaiterSet::new(compaction_threshold),
            cancel,
        }),
    }))
}

pub(crate) fn new_settled_node<T, E>(outcome: Outcome<T, E>) -> NodeRef<T, E> {
    Rc::new(RefCell::new(Node {
        state: State::Settled(Rc::new(outcome)),
    }))
}

/// Follows `node`'s forwarding chain to its representative, compressing every
/// intermediate link onto the representative along the way.
pub(crate) fn find_root<T, E>(node: &NodeRef<T, E>) -> NodeRef<T, E> {
    let mut path = Vec::new();
    let mut current = node.clone();
    loop {
        let next = match &current.borrow().state {
            State::Forward(target) => Some(target.clone()),
            State::Pending(_) | State::Settled(_) => None,
        };
        match next {
            Some(target) => {
                path.push(current);
                current = target;
            }
            None => break,
        }
    }
    for visited in path {
        if !Rc::ptr_eq(&visited, &current) {
            visited.borrow_mut().state = State::Forward(current.clone());
        }
    }
    current
}

/// Settles `node`'s representative with `outcome`, notifying every registered
/// waiter. A no-op (at-most-once) if the representative was already settled.
pub(crate) fn resolve_node<T, E>(node: &NodeRef<T, E>, outcome: Outcome<T, E>) -> bool {
    let root = find_root(node);
    let outcome_rc = Rc::new(outcome);
    let pending = {
        let mut n = root.borrow_mut();
        if matches!(n.state, State::Pending(_)) {
            match std::mem::replace(&mut n.state, State::Settled(outcome_rc.clone())) {
                State::Pending(p) => Some(p),
                State::Settled(_) | State::Forward(_) => unreachable!(),
            }
        } else {
            None
        }
    };
    match pending {
        Some(mut pending) => {
            pending.waiters.notify_all(|w| w(outcome_rc.clone()));
            true
        }
        None => false,
    }
}

/// Arranges for `node` to adopt whatever `target` eventually settles to. If `target`
/// is already settled, `node` settles immediately with the same outcome. Otherwise
/// `node`'s representative becomes a forward pointer at `target`'s representative,
/// and its waiters are absorbed into `target`'s waiter set so they still fire.
///
/// Waiter handles obtained before a forward must be unregistered promptly (the
/// combinators that need removable waiters - `choose`/`pick` - always do so
/// synchronously, within the same settle that triggered the forward), since a
/// handle's slot index is only valid in the list it was issued against.
pub(crate) fn forward_node<T, E>(node: &NodeRef<T, E>, target: &NodeRef<T, E>) {
    let node_root = find_root(node);
    let target_root = find_root(target);
    if Rc::ptr_eq(&node_root, &target_root) {
        return;
    }

    let target_outcome = match &target_root.borrow().state {
        State::Settled(outcome) => Some(outcome.clone()),
        State::Pending(_) | State::Forward(_) => None,
    };

    if let Some(outcome) = target_outcome {
        let pending = {
            let mut n = node_root.borrow_mut();
            if matches!(n.state, State::Pending(_)) {
                match std::mem::replace(&mut n.state, State::Settled(outcome.clone())) {
                    State::Pending(p) => Some(p),
                    State::Settled(_) | State::Forward(_) => unreachable!(),
                }
            } else {
                None
            }
        };
        if let Some(mut pending) = pending {
            pending.waiters.notify_all(|w| w(outcome.clone()));
        }
        return;
    }

    let node_pending = {
        let mut n = node_root.borrow_mut();
        if matches!(n.state, State::Pending(_)) {
            match std::mem::replace(&mut n.state, State::Forward(target_root.clone())) {
                State::Pending(p) => Some(p),
                State::Settled(_) | State::Forward(_) => unreachable!(),
            }
        } else {
            None
        }
    };
    if let Some(node_pending) = node_pending {
        let mut t = target_root.borrow_mut();
        if let State::Pending(target_pending) = &mut t.state {
            target_pending.waiters.absorb(node_pending.waiters);
        }
    }
}

/// Returns the representative's settled outcome, or `None` if it is still pending.
pub(crate) fn peek_outcome<T, E>(node: &NodeRef<T, E>) -> Option<Rc<Outcome<T, E>>> {
    let root = find_root(node);
    let n = root.borrow();
    match &n.state {
        State::Settled(outcome) => Some(outcome.clone()),
        State::Pending(_) | State::Forward(_) => None,
    }
}

/// Registers `f` to run once the representative settles, or immediately (still
/// outside of any borrow) if it already has.
pub(crate) fn register_permanent<T, E>(node: &NodeRef<T, E>, f: Waiter<T, E>) {
    let root = find_root(node);
    let already = peek_outcome(&root);
    match already {
        Some(outcome) => f(outcome),
        None => {
            let mut n = root.borrow_mut();
            if let State::Pending(p) = &mut n.state {
                p.waiters.add_permanent(f);
            }
        }
    }
}

/// Registers a removable waiter, returning the representative node and the handle
/// needed to unregister it - or `None` if the representative was already settled
/// (in which case `f` ran immediately instead).
pub(crate) fn register_removable<T, E>(
    node: &NodeRef<T, E>,
    f: Waiter<T, E>,
) -> Option<(NodeRef<T, E>, WaiterHandle)> {
    let root = find_root(node);
    let already = peek_outcome(&root);
    match already {
        Some(outcome) => {
            f(outcome);
            None
        }
        None => {
            let mut n = root.borrow_mut();
            if let State::Pending(p) = &mut n.state {
                let handle = p.waiters.add_removable(f);
                drop(n);
                Some((root, handle))
            } else {
                None
            }
        }
    }
}

/// Unregisters a waiter previously returned by [`register_removable`] against the
/// same representative node.
pub(crate) fn unregister_removable<T, E>(root: &NodeRef<T, E>, handle: WaiterHandle) {
    let n = root.borrow();
    if let State::Pending(p) = &n.state {
        p.waiters.remove(handle);
    }
}

/// Invokes the representative's cancel handle, if it is still pending and has one.
/// No-op if already settled or already has none (already invoked thunks are expected
/// to guard their own idempotency, matching the "at most once" cancellation
/// contract).
pub(crate) fn invoke_cancel<T, E>(node: &NodeRef<T, E>) {
    let root = find_root(node);
    let cancel = {
        let n = root.borrow();
        match &n.state {
            State::Pending(p) => p.cancel.clone(),
            State::Settled(_) | State::Forward(_) => None,
        }
    };
    if let Some(cancel) = cancel {
        cancel.invoke();
    }
}

/// Settles `node`'s representative to [`Outcome::Cancelled`] and invokes its cancel
/// handle (in that order, so waiters observe the cancellation before the producer is
/// asked to stop). Returns `false` if it was already settled.
pub(crate) fn cancel_node<T, E>(node: &NodeRef<T, E>) -> bool {
    let root = find_root(node);
    let outcome = Rc::new(Outcome::Cancelled);
    let extracted = {
        let mut n = root.borrow_mut();
        if matches!(n.state, State::Pending(_)) {
            match std::mem::replace(&mut n.state, State::Settled(outcome.clone())) {
                State::Pending(p) => Some(p),
                State::Settled(_) | State::Forward(_) => unreachable!(),
            }
        } else {
            None
        }
    };
    match extracted {
        Some(mut pending) => {
            pending.waiters.notify_all(|w| w(outcome.clone()));
            if let Some(cancel) = pending.cancel {
                cancel.invoke();
            }
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_notifies_registered_waiters() {
        let node: NodeRef<i32, ()> = new_pending_node(42, None);
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        register_permanent(
            &node,
            Box::new(move |outcome| {
                *seen_clone.borrow_mut() = Some(matches!(*outcome, Outcome::Resolved(5)));
            }),
        );
        resolve_node(&node, Outcome::Resolved(5));
        assert_eq!(*seen.borrow(), Some(true));
    }

    #[test]
    fn resolve_is_idempotent() {
        let node: NodeRef<i32, ()> = new_pending_node(42, None);
        assert!(resolve_node(&node, Outcome::Resolved(1)));
        assert!(!resolve_node(&node, Outcome::Resolved(2)));
        let outcome = peek_outcome(&node).unwrap();
        assert!(matches!(*outcome, Outcome::Resolved(1)));
    }

    #[test]
    fn register_after_settle_runs_immediately() {
        let node: NodeRef<i32, ()> = new_pending_node(42, None);
        resolve_node(&node, Outcome::Resolved(7));
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        register_permanent(
            &node,
            Box::new(move |outcome| {
                *seen_clone.borrow_mut() = match *outcome {
                    Outcome::Resolved(v) => Some(v),
                    _ => None,
                };
            }),
        );
        assert_eq!(*seen.borrow(), Some(7));
    }

    #[test]
    fn forward_onto_pending_target_compresses_and_merges_waiters() {
        let a: NodeRef<i32, ()> = new_pending_node(42, None);
        let b: NodeRef<i32, ()> = new_pending_node(42, None);
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        register_permanent(
            &a,
            Box::new(move |outcome| {
                *seen_clone.borrow_mut() = match *outcome {
                    Outcome::Resolved(v) => Some(v),
                    _ => None,
                };
            }),
        );
        forward_node(&a, &b);
        resolve_node(&b, Outcome::Resolved(9));
        assert_eq!(*seen.borrow(), Some(9));
        // a's root is now b: resolving through a should be a no-op second settle.
        assert!(!resolve_node(&a, Outcome::Resolved(1)));
    }

    #[test]
    fn forward_onto_already_settled_target_settles_immediately() {
        let a: NodeRef<i32, ()> = new_pending_node(42, None);
        let b: NodeRef<i32, ()> = new_settled_node(Outcome::Resolved(3));
        forward_node(&a, &b);
        let outcome = peek_outcome(&a).unwrap();
        assert!(matches!(*outcome, Outcome::Resolved(3)));
    }

    #[test]
    fn cancel_node_settles_and_invokes_handle_exactly_once() {
        let calls = Rc::new(RefCell::new(0));
        let calls_clone = calls.clone();
        let node: NodeRef<i32, ()> =
            new_pending_node(42, Some(CancelHandle::new(move || *calls_clone.borrow_mut() += 1)));
        assert!(cancel_node(&node));
        assert!(matches!(*peek_outcome(&node).unwrap(), Outcome::Cancelled));
        assert!(!cancel_node(&node));
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn cancel_handle_invoked_exactly_when_pending() {
        let calls = Rc::new(RefCell::new(0));
        let calls_clone = calls.clone();
        let node: NodeRef<i32, ()> =
            new_pending_node(42, Some(CancelHandle::new(move || *calls_clone.borrow_mut() += 1)));
        invoke_cancel(&node);
        resolve_node(&node, Outcome::Cancelled);
        invoke_cancel(&node);
        assert_eq!(*calls.borrow(), 1);
    }
}
