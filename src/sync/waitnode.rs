// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The wait node: the single synchronization primitive that every
//! suspension point (I/O readiness, timer expiry, mutex/event/wait-group/
//! channel wakeups) is built out of.
//!
//! spec.md §3 describes the wait node as embedded inline in the coroutine
//! frame; here it is a small `Arc`-shared record instead. An intrusive,
//! inline linked list threaded through raw pointers is how the upstream C++
//! runtime (and the teacher's own `ReadyStates`) does it, but hand-rolling
//! that without a compiler in the loop is exactly the kind of unsafe code
//! this exercise should not gamble on; `Arc<WaitNode>` gives the same
//! "exactly one source wins" guarantee with a safe, auditable
//! compare-and-swap instead of raw pointer surgery.
//!
//! spec.md §3's invariant — "the same coroutine pointer may be signalled at
//! most once... exactly one source wins via a single compare-and-swap on
//! the wait-node state" — is `WaitNode::try_wake`/`try_cancel` below: both
//! attempt the same `Waiting -> {Woken,Cancelled}` transition, so when I/O
//! readiness and a timeout race, only one of them gets the coroutine handle
//! back.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use crate::coroutine;

const WAITING: u8 = 0;
const WOKEN: u8 = 1;
const CANCELLED: u8 = 2;

/// The outcome recorded on a wait node when it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Someone woke it up (I/O readiness, an `unlock`/`signal`/`done`, a channel hand-off).
    Woken,
    /// It timed out or its scheduler shut down before anyone woke it.
    Cancelled,
}

/// A single-use suspension record. Created when a coroutine is about to
/// suspend, handed to whatever primitives it's waiting on (a mutex's FIFO
/// list, an fd's readiness slot, the timer wheel), and resolved exactly
/// once.
pub struct WaitNode {
    state: AtomicU8,
    coroutine: Mutex<Option<coroutine::Handle>>,
}

impl WaitNode {
    /// Park `handle` in a fresh, `Waiting` wait node.
    pub fn new(handle: coroutine::Handle) -> WaitNode {
        WaitNode {
            state: AtomicU8::new(WAITING),
            coroutine: Mutex::new(Some(handle)),
        }
    }

    /// Attempt to claim this node as woken (a real event arrived). Returns
    /// the parked coroutine exactly to the caller that wins the race; every
    /// other caller (including a racing `try_cancel`) gets `None`.
    pub fn try_wake(&self) -> Option<coroutine::Handle> {
        self.claim(WOKEN)
    }

    /// Attempt to claim this node as cancelled (a timeout elapsed, or the
    /// owning scheduler is shutting down). Same single-winner contract as
    /// `try_wake`.
    pub fn try_cancel(&self) -> Option<coroutine::Handle> {
        self.claim(CANCELLED)
    }

    fn claim(&self, to: u8) -> Option<coroutine::Handle> {
        if self
            .state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(
                self.coroutine
                    .lock()
                    .unwrap()
                    .take()
                    .expect("wait node won its CAS but had no parked coroutine"),
            )
        } else {
            None
        }
    }

    /// The resolved outcome, if any. `None` while still `Waiting`.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.state.load(Ordering::Acquire) {
            WOKEN => Some(Outcome::Woken),
            CANCELLED => Some(Outcome::Cancelled),
            _ => None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MIN_STACK_SIZE;
    use crate::runtime::scheduler::WeakHandle;
    use context::stack::ProtectedFixedSizeStack;
    use std::sync::Arc;
    use std::thread;

    fn dummy_handle() -> coroutine::Handle {
        let mut co = coroutine::Coroutine::spawn(Box::new(|| {}), MIN_STACK_SIZE, WeakHandle::none(), None);
        let stack = ProtectedFixedSizeStack::new(MIN_STACK_SIZE).unwrap();
        co.bind_stack(stack);
        co
    }

    #[test]
    fn only_one_of_wake_and_cancel_wins() {
        let node = Arc::new(WaitNode::new(dummy_handle()));
        let a = node.clone();
        let b = node.clone();

        let t1 = thread::spawn(move || a.try_wake().is_some());
        let t2 = thread::spawn(move || b.try_cancel().is_some());

        let won_wake = t1.join().unwrap();
        let won_cancel = t2.join().unwrap();

        assert!(won_wake ^ won_cancel, "exactly one side should claim the node");
        assert!(!node.is_waiting());
    }

    #[test]
    fn second_claim_after_resolution_yields_nothing() {
        let node = WaitNode::new(dummy_handle());
        assert!(node.try_wake().is_some());
        assert!(node.try_wake().is_none());
        assert!(node.try_cancel().is_none());
        assert_eq!(node.outcome(), Some(Outcome::Woken));
    }
}
