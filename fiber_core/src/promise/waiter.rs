// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The set of callbacks waiting on a pending deferred.
//!
//! Two registration kinds are supported. *Permanent* waiters (ordinary `bind`/`map`
//! continuations) run exactly once, when the deferred settles, and are never removed
//! before that. *Removable* waiters can be unregistered while still pending - the
//! losing branches of a `choose`/`pick` do this to stop watching once a sibling has
//! won. Unregistering only clears an interior-mutable cell rather than physically
//! unlinking the slot (mirrors the teacher's `WakerSlotReader`/`WakerSlotWriter` split
//! over a shared `Option<K>` cell): this keeps `remove` a `&self` operation, safe to
//! call from inside another waiter's callback without reentering a `&mut` borrow.
//! Cleared slots are reclaimed in a batch once [`WaiterSet::cleared_count`] crosses
//! the configured threshold.

use std::cell::{Cell, RefCell};

use crate::intrusive::{Handle, IntrusiveList};

enum Entry<F> {
    Permanent(F),
    Removable(RefCell<Option<F>>),
}

/// A handle to a removable waiter registration, returned by [`WaiterSet::add_removable`].
#[derive(Clone, Copy)]
pub struct WaiterHandle(Handle);

/// A set of waiter callbacks attached to one pending deferred.
pub struct WaiterSet<F> {
    list: IntrusiveList<Entry<F>>,
    cleared_count: Cell<usize>,
    compaction_threshold: usize,
}

impl<F> WaiterSet<F> {
    #[must_use]
    pub fn new(compaction_threshold: usize) -> Self {
        Self {
            list: IntrusiveList::new(),
            cleared_count: Cell::new(0),
            compaction_threshold,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.list.is_empty() }

    /// Registers a waiter that cannot be individually removed.
    pub fn add_permanent(&mut self, f: F) {
        self.compact_if_needed();
        self.list.push_back(Entry::Permanent(f));
    }

    /// Registers a waiter that can later be unregistered via [`WaiterSet::remove`].
    pub fn add_removable(&mut self, f: F) -> WaiterHandle {
        self.compact_if_needed();
        WaiterHandle(self.list.push_back(Entry::Removable(RefCell::new(Some(f)))))
    }

    /// Unregisters a removable waiter. A no-op if it was already removed, already
    /// fired, or belongs to a different (possibly since-compacted) set.
    ///
    /// Only clears the slot's cell; physical reclamation happens during the next
    /// [`compact_if_needed`](Self::compact_if_needed) call. Safe to call while this
    /// set is mid-[`notify_all`](Self::notify_all), since that drains the list by
    /// value and no longer holds any reference into it.
    pub fn remove(&self, handle: WaiterHandle) {
        if let Some(Entry::Removable(cell)) = self.list.get(handle.0)
            && cell.borrow_mut().take().is_some()
        {
            self.cleared_count.set(self.cleared_count.get() + 1);
        }
    }

    /// Rebuilds the backing list, dropping cleared removable slots, if the cleared
    /// count has crossed the compaction threshold.
    fn compact_if_needed(&mut self) {
        if self.cleared_count.get() < self.compaction_threshold {
            return;
        }
        let old = std::mem::take(&mut self.list);
        for entry in old {
            match entry {
                Entry::Permanent(f) => {
                    self.list.push_back(Entry::Permanent(f));
                }
                Entry::Removable(cell) => {
                    if let Some(f) = cell.into_inner() {
                        self.list.push_back(Entry::Removable(RefCell::new(Some(f))));
                    }
                }
            }
        }
        self.cleared_count.set(0);
    }

    /// Moves every waiter in `other` into `self`, preserving relative order (`self`'s
    /// waiters first). Used when one deferred is forwarded onto another and the two
    /// waiter sets must merge.
    pub fn absorb(&mut self, other: Self) {
        for entry in other.list {
            self.list.push_back(entry);
        }
        self.cleared_count
            .set(self.cleared_count.get() + other.cleared_count.get());
    }

    /// Drains every live waiter (in registration order) through `call`, consuming
    /// this set. Called exactly once, when the owning deferred settles.
    pub fn notify_all(&mut self, mut call: impl FnMut(F)) {
        let drained = std::mem::take(&mut self.list);
        for entry in drained {
            match entry {
                Entry::Permanent(f) => call(f),
                Entry::Removable(cell) => {
                    if let Some(f) = cell.into_inner() {
                        call(f);
                    }
                }
            }
        }
        self.cleared_count.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn permanent_waiters_fire_in_registration_order() {
        let mut set: WaiterSet<Box<dyn FnOnce()>> = WaiterSet::new(42);
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            set.add_permanent(Box::new(move || order.borrow_mut().push(i)));
        }
        set.notify_all(|f| f());
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn removed_waiter_does_not_fire() {
        let mut set: WaiterSet<Box<dyn FnOnce()>> = WaiterSet::new(42);
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let handle = set.add_removable(Box::new(move || *f.borrow_mut() = true));
        set.remove(handle);
        set.notify_all(|f| f());
        assert!(!*fired.borrow());
    }

    #[test]
    fn interleaved_permanent_and_removable_preserve_order() {
        let mut set: WaiterSet<Box<dyn FnOnce()>> = WaiterSet::new(42);
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        set.add_permanent(Box::new(move || o1.borrow_mut().push("perm-1")));
        let o2 = order.clone();
        let removable_handle = set.add_removable(Box::new(move || o2.borrow_mut().push("removable")));
        let o3 = order.clone();
        set.add_permanent(Box::new(move || o3.borrow_mut().push("perm-2")));
        set.remove(removable_handle);
        set.notify_all(|f| f());
        assert_eq!(*order.borrow(), vec!["perm-1", "perm-2"]);
    }

    #[test]
    fn compaction_reclaims_cleared_slots_once_threshold_crossed() {
        let mut set: WaiterSet<Box<dyn FnOnce()>> = WaiterSet::new(2);
        let handles: Vec<_> = (0..2)
            .map(|_| set.add_removable(Box::new(|| {})))
            .collect();
        for h in handles {
            set.remove(h);
        }
        // Next registration should trigger compaction, dropping the cleared slots.
        set.add_permanent(Box::new(|| {}));
        assert_eq!(set.list.len(), 1);
    }

    #[test]
    fn absorb_preserves_order_with_self_first() {
        let mut a: WaiterSet<Box<dyn FnOnce()>> = WaiterSet::new(42);
        let mut b: WaiterSet<Box<dyn FnOnce()>> = WaiterSet::new(42);
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        a.add_permanent(Box::new(move || o1.borrow_mut().push("a")));
        let o2 = order.clone();
        b.add_permanent(Box::new(move || o2.borrow_mut().push("b")));
        a.absorb(b);
        a.notify_all(|f| f());
        assert_eq!(*order.borrow(), vec!["a", "b"]);
    }
}
