// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-scheduler timer wheel: an absolute-deadline min-ordered structure
//! keyed on monotonic time.
//!
//! spec.md §4.3 allows either a 4-level hierarchical wheel or a balanced
//! binary tree with O(log n) insert and O(1) amortized expiry. This picks
//! the binary-heap-with-lazy-deletion design: `insert` is O(log n),
//! `cancel` is O(1) (it just removes the payload; the heap entry becomes
//! stale and is silently dropped the next time it would otherwise be
//! popped), and `next_deadline`/`expire_before` are O(log n) worst case but
//! O(1) amortized, since each stale entry is purged exactly once over its
//! lifetime.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Identifies a single armed timer. A coroutine has at most one live
/// `TimerId` at a time per spec.md §3's "a coroutine has at most one active
/// timer."
pub type TimerId = u64;

struct HeapEntry {
    deadline: Instant,
    id: TimerId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A min-ordered set of `(deadline, payload)` pairs.
///
/// `T` is whatever the owning scheduler wants woken on expiry — typically a
/// coroutine handle or a wait-node pointer. Kept generic so this module has
/// no dependency on the coroutine/scheduler types, per the leaves-first
/// dependency order in spec.md §2.
pub struct Wheel<T> {
    heap: BinaryHeap<HeapEntry>,
    payloads: HashMap<TimerId, T>,
    next_id: TimerId,
}

impl<T> Wheel<T> {
    pub fn new() -> Wheel<T> {
        Wheel {
            heap: BinaryHeap::new(),
            payloads: HashMap::new(),
            next_id: 0,
        }
    }

    /// Arm a timer for `deadline`, returning an id that can later be passed
    /// to [`cancel`](Wheel::cancel).
    pub fn insert(&mut self, deadline: Instant, payload: T) -> TimerId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.heap.push(HeapEntry { deadline, id });
        self.payloads.insert(id, payload);
        id
    }

    /// Cancel a timer before it fires, returning its payload if it hadn't
    /// already expired. A coroutine deregisters its timer on wake per
    /// spec.md §4.3.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.payloads.remove(&id)
    }

    /// The earliest deadline still armed, purging any stale (cancelled)
    /// entries found along the way. Used by the scheduler loop to compute
    /// its I/O poll timeout (spec.md §4.2 step 1).
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.purge_stale();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop every timer whose deadline is `<= now`, in deadline order.
    pub fn expire_before(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut expired = Vec::new();
        loop {
            match self.heap.peek() {
                Some(top) if top.deadline <= now => {
                    let entry = self.heap.pop().unwrap();
                    if let Some(payload) = self.payloads.remove(&entry.id) {
                        expired.push((entry.id, payload));
                    }
                    // else: stale entry from a cancelled timer, drop silently.
                }
                _ => break,
            }
        }
        expired
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    fn purge_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.payloads.contains_key(&top.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<T> Default for Wheel<T> {
    fn default() -> Wheel<T> {
        Wheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expires_in_deadline_order() {
        let mut wheel: Wheel<&'static str> = Wheel::new();
        let base = Instant::now();
        wheel.insert(base + Duration::from_millis(30), "third");
        wheel.insert(base + Duration::from_millis(10), "first");
        wheel.insert(base + Duration::from_millis(20), "second");

        let expired = wheel.expire_before(base + Duration::from_millis(25));
        let order: Vec<&str> = expired.into_iter().map(|(_, p)| p).collect();
        assert_eq!(order, vec!["first", "second"]);

        let rest = wheel.expire_before(base + Duration::from_millis(30));
        assert_eq!(rest.into_iter().map(|(_, p)| p).collect::<Vec<_>>(), vec!["third"]);
    }

    #[test]
    fn cancel_prevents_expiry() {
        let mut wheel: Wheel<u32> = Wheel::new();
        let base = Instant::now();
        let id = wheel.insert(base + Duration::from_millis(10), 1);
        assert_eq!(wheel.cancel(id), Some(1));
        assert_eq!(wheel.cancel(id), None, "double cancel yields nothing");

        let expired = wheel.expire_before(base + Duration::from_secs(1));
        assert!(expired.is_empty());
    }

    #[test]
    fn next_deadline_purges_cancelled_entries() {
        let mut wheel: Wheel<u32> = Wheel::new();
        let base = Instant::now();
        let id_a = wheel.insert(base + Duration::from_millis(5), 1);
        let id_b = wheel.insert(base + Duration::from_millis(50), 2);

        wheel.cancel(id_a);
        assert_eq!(wheel.next_deadline(), Some(base + Duration::from_millis(50)));

        wheel.cancel(id_b);
        assert_eq!(wheel.next_deadline(), None);
    }

    #[test]
    fn is_empty_reflects_live_payloads_only() {
        let mut wheel: Wheel<u32> = Wheel::new();
        assert!(wheel.is_empty());
        let id = wheel.insert(Instant::now(), 1);
        assert!(!wheel.is_empty());
        wheel.cancel(id);
        assert!(wheel.is_empty());
    }
}
