// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `JoinHandle<T>`: the typed result of `go()`, mirroring
//! `std::thread::JoinHandle` but suspending the caller instead of blocking
//! its OS thread.
//!
//! The body itself (`runtime::fleet::spawn_opts`) records a normal return
//! value directly into `Shared::result`; a panicking body never reaches
//! that line, so the payload `Coroutine::take_panic` captured at the
//! trampoline is instead delivered by `runtime::scheduler::resume_one`
//! through the `on_finish` hook installed alongside the coroutine, which is
//! the only point that has both the payload and the certainty the body has
//! actually stopped running.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::error::TaskFailed;
use crate::sync::Event;

pub(crate) struct Shared<T> {
    done: Event,
    result: Mutex<Option<Result<T, TaskFailed>>>,
}

/// A handle to a spawned coroutine's eventual result.
pub struct JoinHandle<T> {
    shared: Arc<Shared<T>>,
}

pub(crate) fn new_pair<T>() -> (JoinHandle<T>, Arc<Shared<T>>) {
    let shared = Arc::new(Shared {
        done: Event::new(),
        result: Mutex::new(None),
    });
    (JoinHandle { shared: shared.clone() }, shared)
}

/// Called from inside the coroutine body once `f()` returns normally.
pub(crate) fn report_value<T>(shared: &Shared<T>, value: T) {
    *shared.result.lock().unwrap() = Some(Ok(value));
}

/// Called from `resume_one` after a dead coroutine is found still carrying
/// a panic payload — i.e. `report_value` above never ran.
pub(crate) fn report_panic<T>(shared: &Shared<T>, payload: Box<dyn Any + Send + 'static>) {
    *shared.result.lock().unwrap() = Some(Err(TaskFailed::Panicked(payload)));
}

/// Marks the task finished either way; always the last thing done to a
/// `Shared<T>`, so `JoinHandle::join`'s wait can only return once a result
/// (whichever kind) is actually in place.
pub(crate) fn signal_done<T>(shared: &Shared<T>) {
    shared.done.signal();
}

impl<T: Send + 'static> JoinHandle<T> {
    /// Suspend the calling coroutine until the spawned task finishes,
    /// returning its value or the reason it never produced one.
    pub fn join(&self) -> Result<T, TaskFailed> {
        self.shared.done.wait();
        self.shared
            .result
            .lock()
            .unwrap()
            .take()
            .expect("join result missing after completion event fired")
    }

    pub fn is_finished(&self) -> bool {
        self.shared.done.is_signaled()
    }

    /// Like [`join`](JoinHandle::join), but blocks the calling OS thread
    /// instead of suspending a coroutine. For callers outside the runtime
    /// entirely (`Scheduler::run`, a plain `main`) — calling this from
    /// inside a coroutine would stall its own scheduler thread.
    pub fn join_blocking(&self) -> Result<T, TaskFailed> {
        self.shared.done.wait_blocking();
        self.shared
            .result
            .lock()
            .unwrap()
            .take()
            .expect("join result missing after completion event fired")
    }
}

#[cfg(test)]
mod tests {
    use crate::error::TaskFailed;
    use crate::runtime::fleet;

    #[test]
    fn join_returns_the_coroutine_result() {
        let handle = fleet::go(|| 1 + 1);
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn join_after_panic_reports_the_payload() {
        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let handle = fleet::go(|| -> u32 { panic!("boom") });
        let result = handle.join();
        std::panic::set_hook(prev_hook);
        match result {
            Err(TaskFailed::Panicked(payload)) => {
                assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");
            }
            other => panic!("expected Panicked, got {:?}", other),
        }
    }
}
