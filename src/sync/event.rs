// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A signalled flag any number of coroutines can `wait()` on, in either of
//! two modes (mirroring the original `Event(bool manual, bool signaled)`
//! constructor and Win32's manual/auto-reset events):
//!
//! - **Manual**: `signal()` wakes every current and future waiter, and stays
//!   signalled until an explicit [`reset`](Event::reset).
//! - **Auto**: `signal()` wakes exactly one waiter (FIFO) and immediately
//!   un-signals; a `signal()` with nobody waiting leaves the flag signalled
//!   for exactly the next `wait()` to consume, then it resets itself.
//!
//! Also usable from a plain OS thread via [`wait_blocking`](Event::wait_blocking),
//! which parks on a `Condvar` rather than suspending a coroutine — the
//! non-coroutine fallback the original `co::Event` supports, needed by
//! anything (a `main` function, `Scheduler::run`) that observes a
//! coroutine-raised event from outside the runtime.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar};
use std::time::{Duration, Instant};

use crate::coroutine::{self, State};
use crate::runtime::scheduler;
use crate::sync::waitnode::{Outcome, WaitNode};
use crate::timer::TimerId;

/// Whether a signal wakes every waiter ([`Manual`](Mode::Manual)) or exactly
/// one ([`Auto`](Mode::Auto)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Manual,
    Auto,
}

struct Meta {
    mode: Mode,
    signaled: bool,
    waiters: VecDeque<Arc<WaitNode>>,
}

pub struct Event {
    meta: std::sync::Mutex<Meta>,
    condvar: Condvar,
}

impl Event {
    /// A manual-reset event, unsignalled.
    pub fn new() -> Event {
        Event::with_mode(Mode::Manual)
    }

    /// An auto-reset event, unsignalled: each `signal()` wakes exactly one
    /// waiter instead of every waiter.
    pub fn auto() -> Event {
        Event::with_mode(Mode::Auto)
    }

    fn with_mode(mode: Mode) -> Event {
        Event {
            meta: std::sync::Mutex::new(Meta {
                mode,
                signaled: false,
                waiters: VecDeque::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// If `meta.signaled`, claim it (clearing it right back for an auto
    /// event, since exactly one waiter may ever take a given signal) and
    /// report `true`.
    fn consume_signal(meta: &mut Meta) -> bool {
        if meta.signaled {
            if meta.mode == Mode::Auto {
                meta.signaled = false;
            }
            true
        } else {
            false
        }
    }

    /// Block the calling OS thread (not a coroutine) until `signal()` is
    /// called. Panics if called from inside a running coroutine — that
    /// would block the scheduler's own thread; use `wait()` there instead.
    pub fn wait_blocking(&self) {
        debug_assert!(
            coroutine::current().is_none(),
            "wait_blocking would stall the scheduler thread; use wait() inside a coroutine"
        );
        let mut meta = self.meta.lock().unwrap();
        loop {
            if Self::consume_signal(&mut meta) {
                return;
            }
            meta = self.condvar.wait(meta).unwrap();
        }
    }

    /// Suspend the calling coroutine until [`signal`](Event::signal) is
    /// called, returning immediately if it already has been.
    pub fn wait(&self) {
        {
            let mut meta = self.meta.lock().unwrap();
            if Self::consume_signal(&mut meta) {
                return;
            }
        }
        scheduler::park_with(State::WaitSync, move |sched, co| {
            let node = Arc::new(WaitNode::new(co));
            let mut meta = self.meta.lock().unwrap();
            if Self::consume_signal(&mut meta) {
                drop(meta);
                if let Some(co) = node.try_wake() {
                    sched.dispatch(co);
                }
            } else {
                meta.waiters.push_back(node);
            }
        });
    }

    /// Like [`wait`](Event::wait), but gives up after `timeout`. Returns
    /// `true` if `signal()` actually fired, `false` on timeout — the bool
    /// split between that outcome and scheduler-level failure (there is
    /// none to report here; `Event` has no closed state).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        {
            let mut meta = self.meta.lock().unwrap();
            if Self::consume_signal(&mut meta) {
                return true;
            }
        }

        let deadline = Instant::now() + timeout;
        let node_cell: Cell<Option<Arc<WaitNode>>> = Cell::new(None);
        let node_ptr: *const Cell<Option<Arc<WaitNode>>> = &node_cell;
        let timer_cell: Cell<Option<TimerId>> = Cell::new(None);
        let timer_ptr: *const Cell<Option<TimerId>> = &timer_cell;

        scheduler::park_with(State::WaitSync, move |sched, co| {
            let node = Arc::new(WaitNode::new(co));
            let mut meta = self.meta.lock().unwrap();
            if Self::consume_signal(&mut meta) {
                drop(meta);
                if let Some(co) = node.try_wake() {
                    sched.dispatch(co);
                }
                return;
            }
            meta.waiters.push_back(node.clone());
            drop(meta);
            let id = scheduler::arm_timer(deadline, node.clone());
            unsafe {
                (*node_ptr).set(Some(node));
                (*timer_ptr).set(Some(id));
            }
        });

        if let Some(id) = timer_cell.get() {
            scheduler::disarm_timer(id);
        }
        match node_cell.into_inner() {
            Some(node) => matches!(node.outcome(), Some(Outcome::Woken)),
            None => true,
        }
    }

    /// In manual mode, wake every coroutine currently in `wait()` and stay
    /// signalled for every future `wait()` until [`reset`](Event::reset).
    /// In auto mode, wake exactly one waiter (the longest-parked one), or —
    /// if nobody is waiting — leave the flag signalled for exactly the next
    /// `wait()` to consume.
    pub fn signal(&self) {
        let (mode, woken) = {
            let mut meta = self.meta.lock().unwrap();
            let mode = meta.mode;
            let woken = match mode {
                Mode::Manual => {
                    meta.signaled = true;
                    std::mem::take(&mut meta.waiters)
                }
                Mode::Auto => match meta.waiters.pop_front() {
                    Some(node) => VecDeque::from([node]),
                    None => {
                        meta.signaled = true;
                        VecDeque::new()
                    }
                },
            };
            (mode, woken)
        };

        match mode {
            Mode::Manual => self.condvar.notify_all(),
            Mode::Auto => self.condvar.notify_one(),
        }
        for node in woken {
            if let Some(co) = node.try_wake() {
                if let Some(sched) = co.scheduler().upgrade() {
                    sched.dispatch(co);
                }
            }
        }
    }

    /// Arm the event again; subsequent `wait()` calls will block until the
    /// next `signal()`. Mostly useful for a manual event — an auto event
    /// resets itself the instant a signal is consumed.
    pub fn reset(&self) {
        self.meta.lock().unwrap().signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.meta.lock().unwrap().signaled
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
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
    fn wait_returns_immediately_once_already_signaled() {
        let ev = Event::new();
        ev.signal();
        ev.wait(); // must not hang
    }

    #[test]
    fn signal_wakes_all_waiters_in_manual_mode() {
        let ev = StdArc::new(Event::new());
        let (tx, rx) = channel();

        for _ in 0..5 {
            let ev = ev.clone();
            let tx = tx.clone();
            fleet::go(move || {
                ev.wait();
                tx.send(()).unwrap();
            });
        }

        fleet::go({
            let ev = ev.clone();
            move || ev.signal()
        });

        for _ in 0..5 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
    }

    #[test]
    fn signal_wakes_exactly_one_waiter_in_auto_mode() {
        let ev = StdArc::new(Event::auto());
        let (tx, rx) = channel();

        for _ in 0..3 {
            let ev = ev.clone();
            let tx = tx.clone();
            fleet::go(move || {
                ev.wait();
                tx.send(()).unwrap();
            });
        }

        fleet::go({
            let ev = ev.clone();
            move || ev.signal()
        });

        // Exactly one of the three waiters should have woken.
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        fleet::go({
            let ev = ev.clone();
            move || ev.signal()
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn auto_mode_signal_with_no_waiters_is_consumed_by_the_next_wait() {
        let ev = Event::auto();
        ev.signal();
        ev.wait(); // consumes the pending signal
        assert!(!ev.is_signaled(), "auto event resets itself on consumption");
    }

    #[test]
    fn wait_timeout_reports_false_when_nobody_signals() {
        let (tx, rx) = channel();
        fleet::go(move || {
            let ev = Event::new();
            let fired = ev.wait_timeout(Duration::from_millis(20));
            tx.send(fired).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), false);
    }

    #[test]
    fn wait_timeout_reports_true_when_signaled_in_time() {
        let ev = StdArc::new(Event::new());
        let (tx, rx) = channel();

        fleet::go({
            let ev = ev.clone();
            move || {
                let fired = ev.wait_timeout(Duration::from_secs(2));
                tx.send(fired).unwrap();
            }
        });
        fleet::go({
            let ev = ev.clone();
            move || ev.signal()
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), true);
    }

    #[test]
    fn wait_blocking_is_woken_by_a_coroutine_signal() {
        let ev = StdArc::new(Event::new());
        fleet::go({
            let ev = ev.clone();
            move || ev.signal()
        });
        ev.wait_blocking(); // must not hang
    }
}
