// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A resource pool (connections, buffers, anything expensive to create),
//! partitioned one sub-pool per scheduler per spec.md §4.5: `pop()` hands
//! back an idle entry from the calling scheduler's own partition or, if
//! empty, calls the caller-supplied `ccb` to mint a fresh one; `push()`
//! returns an entry to that same partition, or hands it to `dcb` once the
//! partition already holds `cap` idle entries. Grounded directly on the
//! original's `Pool(ccb, dcb, cap)` constructor
//! (`examples/original_source/include/co/co/pool.h`): one `Pool`, N
//! thread-private sub-pools, entries never migrate across schedulers.
//!
//! `pop`/`push` must be called from inside a coroutine — a partition is
//! keyed by `SchedulerId`, and there is no sensible partition for a caller
//! with no current scheduler, matching the original's own "MUST be called
//! in a coroutine" requirement.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::runtime::scheduler::{self, SchedulerId};

struct Partition<T> {
    idle: Vec<T>,
    /// Set the first time this scheduler's partition is touched, so its
    /// teardown destructor is registered with that scheduler exactly once.
    teardown_registered: bool,
}

pub struct Pool<T> {
    ccb: Box<dyn Fn() -> T + Send + Sync>,
    dcb: Box<dyn Fn(T) + Send + Sync>,
    cap: usize,
    partitions: Mutex<HashMap<SchedulerId, Partition<T>>>,
}

impl<T: Send + 'static> Pool<T> {
    /// `cap` bounds how many idle entries a single scheduler's partition
    /// keeps around; entries pushed past it go straight to `dcb`.
    ///
    /// Returns an `Arc` rather than a bare `Pool`: a partition's teardown
    /// hook needs to outlive the `pop()` call that registers it (it only
    /// runs once that scheduler itself shuts down), so the pool has to be
    /// kept alive by something other than the caller's stack frame.
    pub fn new<C, D>(ccb: C, dcb: D, cap: usize) -> Arc<Pool<T>>
    where
        C: Fn() -> T + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Arc::new(Pool {
            ccb: Box::new(ccb),
            dcb: Box::new(dcb),
            cap,
            partitions: Mutex::new(HashMap::new()),
        })
    }

    fn current_scheduler() -> SchedulerId {
        scheduler::current_handle()
            .expect("Pool::pop/push must be called from inside a coroutine")
            .id()
    }

    /// Pop an entry from the calling scheduler's partition, creating one
    /// with `ccb` if that partition is empty. `ccb` itself may suspend (a
    /// creator that dials out and awaits the connection, say) — per
    /// spec.md §4.1's suspension-point list, that's a normal, cooperative
    /// wait, not special-cased here.
    pub fn pop(self: &Arc<Self>) -> PoolGuard<T> {
        let id = Self::current_scheduler();

        let (reused, first_touch) = {
            let mut partitions = self.partitions.lock().unwrap();
            let partition = partitions.entry(id).or_insert_with(|| Partition {
                idle: Vec::new(),
                teardown_registered: false,
            });
            let first_touch = !partition.teardown_registered;
            partition.teardown_registered = true;
            (partition.idle.pop(), first_touch)
        };

        if first_touch {
            let pool = self.clone();
            scheduler::register_teardown(move || pool.drain_partition(id));
        }

        let item = reused.unwrap_or_else(|| (self.ccb)());
        PoolGuard {
            pool: self.clone(),
            owner: id,
            item: Some(item),
        }
    }

    /// Return an entry to the scheduler partition it was popped from (not
    /// necessarily the one currently running), or destroy it with `dcb` if
    /// that partition is already holding `cap` idle entries.
    fn push(&self, owner: SchedulerId, item: T) {
        let mut partitions = self.partitions.lock().unwrap();
        let partition = partitions.entry(owner).or_insert_with(|| Partition {
            idle: Vec::new(),
            teardown_registered: false,
        });
        if partition.idle.len() < self.cap {
            partition.idle.push(item);
        } else {
            drop(partitions);
            (self.dcb)(item);
        }
    }

    /// Destroy every entry idle in scheduler `id`'s partition, invoking
    /// `dcb` on each and dropping the partition. Run once by that
    /// scheduler's own `register_teardown` hook, satisfying spec.md §4.5's
    /// "on scheduler teardown the destroy callback is invoked on all
    /// remaining entries."
    fn drain_partition(&self, id: SchedulerId) {
        let idle = {
            let mut partitions = self.partitions.lock().unwrap();
            partitions.remove(&id).map(|p| p.idle).unwrap_or_default()
        };
        for item in idle {
            (self.dcb)(item);
        }
    }

    /// Idle entries across every partition, for tests/observability.
    pub fn idle_count(&self) -> usize {
        self.partitions.lock().unwrap().values().map(|p| p.idle.len()).sum()
    }
}

/// RAII handle returned by [`Pool::pop`]; returns the resource to the pool
/// on drop.
pub struct PoolGuard<T: Send + 'static> {
    pool: Arc<Pool<T>>,
    owner: SchedulerId,
    item: Option<T>,
}

impl<T: Send + 'static> Deref for PoolGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().unwrap()
    }
}

impl<T: Send + 'static> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap()
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.push(self.owner, item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fleet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn reuses_released_entries_instead_of_recreating() {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(
            {
                let created = created.clone();
                move || created.fetch_add(1, Ordering::SeqCst)
            },
            {
                let destroyed = destroyed.clone();
                move |_| {
                    destroyed.fetch_add(1, Ordering::SeqCst);
                }
            },
            2,
        );
        let (tx, rx) = channel();

        for _ in 0..6 {
            let pool = pool.clone();
            let tx = tx.clone();
            fleet::go(move || {
                let _guard = pool.pop();
                tx.send(()).unwrap();
            });
        }

        for _ in 0..6 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert!(created.load(Ordering::SeqCst) >= 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0, "cap was never exceeded");
    }

    #[test]
    fn pushing_past_cap_destroys_instead_of_retaining() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(
            || (),
            {
                let destroyed = destroyed.clone();
                move |_| {
                    destroyed.fetch_add(1, Ordering::SeqCst);
                }
            },
            1,
        );
        let (done_tx, done_rx) = channel();

        {
            let pool = pool.clone();
            let done_tx = done_tx.clone();
            fleet::go(move || {
                let a = pool.pop();
                let b = pool.pop();
                drop(a);
                drop(b);
                done_tx.send(()).unwrap();
            });
        }

        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(pool.idle_count(), 1, "only `cap` entries stay idle");
        assert_eq!(destroyed.load(Ordering::SeqCst), 1, "the rest go through dcb");
    }

    #[test]
    fn scheduler_teardown_destroys_every_remaining_idle_entry() {
        use crate::options::Config;
        use crate::runtime::scheduler;

        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(
            || (),
            {
                let destroyed = destroyed.clone();
                move |_| {
                    destroyed.fetch_add(1, Ordering::SeqCst);
                }
            },
            4,
        );

        let (handle, join) = scheduler::spawn(Config::default());
        let (done_tx, done_rx) = channel();

        {
            let pool = pool.clone();
            let weak = handle.downgrade();
            let body: crate::coroutine::Entry = Box::new(move || {
                for _ in 0..3 {
                    drop(pool.pop());
                }
                done_tx.send(()).unwrap();
            });
            let co = crate::coroutine::Coroutine::spawn(body, crate::options::MIN_STACK_SIZE, weak, None);
            handle.dispatch(co);
        }

        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(pool.idle_count(), 3);

        handle.request_stop();
        join.join().unwrap();

        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.idle_count(), 0);
    }
}
