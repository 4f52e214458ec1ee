// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-scheduler memory: the coroutine stack arena, and the blocking-resolver
//! thread pool DNS lookups are routed to.

use std::collections::VecDeque;
use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use context::stack::ProtectedFixedSizeStack;

/// How many freed stacks a single scheduler keeps around before it starts
/// handing them back to the platform allocator.
const STACK_FREELIST_CAP: usize = 128;

/// A per-scheduler free list of fixed-size, guard-paged stacks.
///
/// Exhaustion of the free list falls back to a direct allocation, per
/// spec.md §4.1. `ProtectedFixedSizeStack` always maps a guard page
/// regardless of size, resolving spec.md §9 Open Question (iii).
pub struct StackArena {
    stack_size: usize,
    free: VecDeque<ProtectedFixedSizeStack>,
}

impl StackArena {
    pub fn new(stack_size: usize) -> StackArena {
        StackArena {
            stack_size,
            free: VecDeque::new(),
        }
    }

    /// Take a stack from the free list, or allocate a fresh one.
    pub fn acquire(&mut self) -> io::Result<ProtectedFixedSizeStack> {
        while let Some(stack) = self.free.pop_front() {
            if stack.len() == self.stack_size {
                return Ok(stack);
            }
            // A stack left over from a previous default size; drop it and keep looking.
        }
        ProtectedFixedSizeStack::new(self.stack_size)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    /// Acquire a stack of an arbitrary size, falling back to a direct
    /// allocation when `size` doesn't match this arena's pooled size (a
    /// coroutine spawned with a non-default `Options::stack_size`).
    pub fn acquire_sized(&mut self, size: usize) -> io::Result<ProtectedFixedSizeStack> {
        if size == self.stack_size {
            return self.acquire();
        }
        ProtectedFixedSizeStack::new(size).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    /// Return a stack to the free list for reuse by the next coroutine
    /// spawned on this scheduler.
    pub fn release(&mut self, stack: ProtectedFixedSizeStack) {
        if self.free.len() < STACK_FREELIST_CAP {
            self.free.push_back(stack);
        }
        // else: drop it, returning the pages to the platform allocator.
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A small fixed-size thread pool for blocking work that must not run on a
/// scheduler thread — in practice, DNS resolution (`net::resolve`), mirroring
/// the spec's requirement that `gethostbyname_r`-equivalent calls are routed
/// to a worker pool because POSIX resolvers block.
pub struct BlockingPool {
    sender: mpsc::Sender<Job>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl BlockingPool {
    pub fn new(threads: usize) -> BlockingPool {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..threads.max(1))
            .map(|id| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("coflow-resolver-{}", id))
                    .spawn(move || {
                        loop {
                            let job = {
                                let rx = rx.lock().unwrap();
                                rx.recv()
                            };
                            match job {
                                Ok(job) => job(),
                                Err(_) => break, // sender dropped: pool is shutting down
                            }
                        }
                    })
                    .expect("failed to spawn blocking-pool worker")
            })
            .collect();

        BlockingPool {
            sender: tx,
            _workers: workers,
        }
    }

    /// Submit a blocking job. Panics if the pool's workers have already shut down.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(job))
            .expect("blocking pool workers have shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn stack_arena_reuses_released_stacks() {
        let mut arena = StackArena::new(crate::options::MIN_STACK_SIZE);
        let stack = arena.acquire().unwrap();
        assert_eq!(arena.free_count(), 0);
        arena.release(stack);
        assert_eq!(arena.free_count(), 1);
        let _ = arena.acquire().unwrap();
        assert_eq!(arena.free_count(), 0);
    }

    #[test]
    fn blocking_pool_runs_jobs_off_thread() {
        let pool = BlockingPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..4 {
            let counter = counter.clone();
            let tx = tx.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }

        for _ in 0..4 {
            rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
