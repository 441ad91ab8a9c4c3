// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Dynamically scoped context: key/value bindings that flow through a chain of
//! combinators and are snapshotted at every suspension point so that a resumed
//! callback sees the bindings active where it was *registered*, not the bindings
//! active where it happens to be *run from*.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A key into the dynamic context. Obtained from [`Key::new`]; each call produces a
/// distinct key even if two keys happen to carry the same name, mirroring the
/// teacher's `common_atomic` monotonic-counter style for cheap unique ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key<T> {
    id: u64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(0);

impl<T: 'static> Key<T> {
    /// Allocates a fresh, globally unique key.
    #[must_use]
    pub fn new() -> Self {
        // fetch_add returns the pre-increment value; each caller gets a distinct id.
        let id = NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: 'static> Default for Key<T> {
    fn default() -> Self { Self::new() }
}

type BoxedValue = Rc<dyn Any>;

#[derive(Clone, Default)]
struct Binding {
    key_id: u64,
    value: BoxedValue,
}

/// An immutable, persistent (structurally shared) snapshot of the dynamic context at
/// some point in a combinator chain. Cloning is O(1): bindings added via
/// [`Context::with_value`] are held as a linked chain of `Rc`s rather than copied.
#[derive(Clone, Default)]
pub struct Context {
    bindings: Option<Rc<Node>>,
}

struct Node {
    binding: Binding,
    parent: Option<Rc<Node>>,
}

impl Context {
    /// The empty context, with no bindings.
    #[must_use]
    pub fn empty() -> Self { Self::default() }

    /// Returns a new context extending `self` with `key` bound to `value`. `self`
    /// is left unchanged - existing handles into it keep seeing the old bindings.
    #[must_use]
    pub fn with_value<T: 'static>(&self, key: Key<T>, value: T) -> Self {
        let binding = Binding {
            key_id: key.id,
            value: Rc::new(value),
        };
        Self {
            bindings: Some(Rc::new(Node {
                binding,
                parent: self.bindings.clone(),
            })),
        }
    }

    /// Looks up the most recent binding for `key`, if any.
    #[must_use]
    pub fn get<T: 'static>(&self, key: Key<T>) -> Option<Rc<T>> {
        let mut node = self.bindings.as_ref();
        while let Some(n) = node {
            if n.binding.key_id == key.id {
                return Rc::downcast::<T>(n.binding.value.clone()).ok();
            }
            node = n.parent.as_ref();
        }
        None
    }
}

thread_local! {
    static CURRENT: RefCell<Context> = RefCell::new(Context::empty());
}

/// Returns the context active at the point this is called - used by combinator
/// constructors to capture "where was this callback registered" for later restore.
#[must_use]
pub fn capture_current() -> Context {
    CURRENT.with(|c| c.borrow().clone())
}

/// Runs `f` with `ctx` installed as the current context, restoring the previous
/// context afterward even if `f` panics.
pub fn with_context<R>(ctx: &Context, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|c| c.replace(ctx.clone()));
    struct Restore(Option<Context>);
    impl Drop for Restore {
        fn drop(&mut self) {
            if let Some(ctx) = self.0.take() {
                CURRENT.with(|c| *c.borrow_mut() = ctx);
            }
        }
    }
    let _restore = Restore(Some(previous));
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_most_recent_binding() {
        let key = Key::<i32>::new();
        let ctx = Context::empty().with_value(key, 1).with_value(key, 2);
        assert_eq!(ctx.get(key).as_deref(), Some(&2));
    }

    #[test]
    fn with_value_does_not_mutate_the_parent_context() {
        let key = Key::<i32>::new();
        let parent = Context::empty().with_value(key, 1);
        let child = parent.with_value(key, 2);
        assert_eq!(parent.get(key).as_deref(), Some(&1));
        assert_eq!(child.get(key).as_deref(), Some(&2));
    }

    #[test]
    fn unbound_key_returns_none() {
        let key = Key::<i32>::new();
        assert_eq!(Context::empty().get(key), None);
    }

    #[test]
    fn with_context_restores_previous_on_exit_including_panic() {
        let key = Key::<i32>::new();
        let outer = Context::empty().with_value(key, 1);
        with_context(&outer, || {});
        assert_eq!(capture_current().get(key), None);

        let inner = Context::empty().with_value(key, 2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_context(&inner, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(capture_current().get(key), None);
    }
}
