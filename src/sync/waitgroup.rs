// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A counting wait group: `add`/`done` adjust an outstanding-work counter,
//! `wait` suspends until it reaches zero.

use std::sync::Arc;

use crate::coroutine::State;
use crate::runtime::scheduler;
use crate::sync::waitnode::WaitNode;

struct Meta {
    count: i64,
    waiters: Vec<Arc<WaitNode>>,
}

pub struct WaitGroup {
    meta: std::sync::Mutex<Meta>,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup {
            meta: std::sync::Mutex::new(Meta {
                count: 0,
                waiters: Vec::new(),
            }),
        }
    }

    /// Adjust the outstanding-work count. `delta` may be negative (usually
    /// via [`done`](WaitGroup::done)). Panics if the count would go negative
    /// — a usage error per spec.md's error taxonomy, not a runtime
    /// condition callers should recover from.
    pub fn add(&self, delta: i64) {
        let waiters = {
            let mut meta = self.meta.lock().unwrap();
            meta.count += delta;
            assert!(meta.count >= 0, "WaitGroup counter went negative");
            if meta.count == 0 {
                std::mem::take(&mut meta.waiters)
            } else {
                Vec::new()
            }
        };
        for node in waiters {
            if let Some(co) = node.try_wake() {
                if let Some(sched) = co.scheduler().upgrade() {
                    sched.dispatch(co);
                }
            }
        }
    }

    pub fn done(&self) {
        self.add(-1);
    }

    /// Suspend the calling coroutine until the counter reaches zero.
    pub fn wait(&self) {
        {
            let meta = self.meta.lock().unwrap();
            if meta.count == 0 {
                return;
            }
        }
        scheduler::park_with(State::WaitSync, move |sched, co| {
            let node = Arc::new(WaitNode::new(co));
            let mut meta = self.meta.lock().unwrap();
            if meta.count == 0 {
                drop(meta);
                if let Some(co) = node.try_wake() {
                    sched.dispatch(co);
                }
            } else {
                meta.waiters.push(node);
            }
        });
    }
}

impl Default for WaitGroup {
    fn default() -> WaitGroup {
        WaitGroup::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fleet;
    use std::sync::mpsc::channel;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_every_task_calls_done() {
        let wg = StdArc::new(WaitGroup::new());
        wg.add(5);
        let (tx, rx) = channel();

        for _ in 0..5 {
            let wg = wg.clone();
            fleet::go(move || wg.done());
        }

        fleet::go({
            let wg = wg.clone();
            move || {
                wg.wait();
                tx.send(()).unwrap();
            }
        });

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    #[should_panic(expected = "negative")]
    fn done_without_matching_add_panics() {
        let wg = WaitGroup::new();
        wg.done();
    }
}
