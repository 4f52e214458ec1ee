// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A bounded MPMC channel between coroutines, plus the capacity-0 special
//! case: a pure rendezvous channel, per spec.md §4.5 and the Glossary.
//!
//! spec.md §9 Open Question (ii) — what happens on send/recv against a
//! closed channel — is resolved in favor of an explicit error rather than a
//! panic: `send` after `close` returns `Err(Closed)` immediately, and a
//! buffered `recv` returns whatever was already queued before finally
//! returning `Err(Closed)` once drained, matching the common "closed
//! channels still yield their backlog" convention rather than discarding
//! it. A rendezvous channel has no backlog to drain: once closed, `recv`
//! fails immediately.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use crate::coroutine::State;
use crate::error::Closed;
use crate::runtime::scheduler;
use crate::sync::waitnode::{Outcome, WaitNode};
use crate::timer::TimerId;

struct Meta<T> {
    queue: VecDeque<T>,
    closed: bool,
    send_waiters: VecDeque<Arc<WaitNode>>,
    recv_waiters: VecDeque<Arc<WaitNode>>,
    /// Rendezvous-mode only (`capacity == 0`): senders parked with a value
    /// in hand, waiting for a receiver to take it directly.
    send_offers: VecDeque<Arc<Rendezvous<T>>>,
    /// Rendezvous-mode only: receivers parked with nothing to take yet,
    /// waiting for a sender to deposit a value into their slot.
    recv_offers: VecDeque<Arc<Rendezvous<T>>>,
}

/// A parked rendezvous participant: a wait node to wake it with, and the
/// slot the value crosses through. A sender creates one with `slot` already
/// full; a receiver creates one with `slot` empty for a sender to fill.
struct Rendezvous<T> {
    wait: Arc<WaitNode>,
    slot: StdMutex<Option<T>>,
}

struct Shared<T> {
    /// `0` means a pure rendezvous channel: no buffering, `send` blocks
    /// until a matching `recv` is there to hand the value to directly.
    /// Immutable after construction, so it lives outside `meta`'s lock.
    capacity: usize,
    meta: StdMutex<Meta<T>>,
}

/// Create a channel. `capacity == 0` creates a rendezvous channel: `send`
/// only ever completes by handing its value straight to a waiting `recv`,
/// never by buffering it.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        capacity,
        meta: StdMutex::new(Meta {
            queue: VecDeque::new(),
            closed: false,
            send_waiters: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            send_offers: VecDeque::new(),
            recv_offers: VecDeque::new(),
        }),
    });
    (Sender { shared: shared.clone() }, Receiver { shared })
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Sender<T> {
        Sender {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Receiver<T> {
        Receiver {
            shared: self.shared.clone(),
        }
    }
}

fn wake_one(node: Arc<WaitNode>) {
    if let Some(co) = node.try_wake() {
        if let Some(sched) = co.scheduler().upgrade() {
            sched.dispatch(co);
        }
    }
}

impl<T: Send + 'static> Sender<T> {
    /// Send a value. On a buffered channel, suspends the caller only if the
    /// channel is full. On a rendezvous channel (`capacity == 0`), always
    /// suspends until a receiver is there to take the value directly.
    /// Returns `Err(Closed)` if the channel has been closed.
    pub fn send(&self, value: T) -> Result<(), Closed> {
        if self.shared.capacity == 0 {
            let delivered = self.send_rendezvous(value, None)?;
            debug_assert!(delivered, "an untimed rendezvous send cannot time out");
            return Ok(());
        }

        let mut value = Some(value);
        loop {
            let wake_recv = {
                let mut meta = self.shared.meta.lock().unwrap();
                if meta.closed {
                    return Err(Closed);
                }
                if meta.queue.len() < self.shared.capacity {
                    meta.queue.push_back(value.take().unwrap());
                    meta.recv_waiters.pop_front()
                } else {
                    None
                }
            };

            if value.is_none() {
                if let Some(node) = wake_recv {
                    wake_one(node);
                }
                return Ok(());
            }

            // Bounded and full: suspend until space opens up or it closes.
            let shared = self.shared.clone();
            scheduler::park_with(State::WaitSync, move |sched, co| {
                let node = Arc::new(WaitNode::new(co));
                let mut meta = shared.meta.lock().unwrap();
                if meta.closed || meta.queue.len() < shared.capacity {
                    drop(meta);
                    if let Some(co) = node.try_wake() {
                        sched.dispatch(co);
                    }
                } else {
                    meta.send_waiters.push_back(node);
                }
            });
        }
    }

    /// Like [`send`](Sender::send), but gives up after `timeout` instead of
    /// waiting indefinitely. `Ok(true)` means the value was delivered
    /// (enqueued on a buffered channel, handed to a receiver on a
    /// rendezvous one); `Ok(false)` means the deadline passed first (the
    /// value is dropped); `Err(Closed)` as in `send`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<bool, Closed> {
        let deadline = Instant::now() + timeout;

        if self.shared.capacity == 0 {
            return self.send_rendezvous(value, Some(deadline));
        }

        let mut value = Some(value);
        loop {
            let wake_recv = {
                let mut meta = self.shared.meta.lock().unwrap();
                if meta.closed {
                    return Err(Closed);
                }
                if meta.queue.len() < self.shared.capacity {
                    meta.queue.push_back(value.take().unwrap());
                    meta.recv_waiters.pop_front()
                } else {
                    None
                }
            };

            if value.is_none() {
                if let Some(node) = wake_recv {
                    wake_one(node);
                }
                return Ok(true);
            }

            if Instant::now() >= deadline {
                return Ok(false);
            }

            let shared = self.shared.clone();
            let node_cell: Cell<Option<Arc<WaitNode>>> = Cell::new(None);
            let node_ptr: *const Cell<Option<Arc<WaitNode>>> = &node_cell;
            let timer_cell: Cell<Option<TimerId>> = Cell::new(None);
            let timer_ptr: *const Cell<Option<TimerId>> = &timer_cell;

            scheduler::park_with(State::WaitSync, move |sched, co| {
                let node = Arc::new(WaitNode::new(co));
                let mut meta = shared.meta.lock().unwrap();
                if meta.closed || meta.queue.len() < shared.capacity {
                    drop(meta);
                    if let Some(co) = node.try_wake() {
                        sched.dispatch(co);
                    }
                    return;
                }
                meta.send_waiters.push_back(node.clone());
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
            if let Some(node) = node_cell.into_inner() {
                if node.outcome() == Some(Outcome::Cancelled) {
                    return Ok(false);
                }
            }
        }
    }

    /// The rendezvous-mode `send`: match an already-waiting receiver
    /// directly, or park with the value in hand until one arrives (or
    /// `deadline` passes, or the channel closes). Never touches `meta.queue`
    /// — a rendezvous channel has no buffer to touch.
    fn send_rendezvous(&self, value: T, deadline: Option<Instant>) -> Result<bool, Closed> {
        let mut value = Some(value);
        loop {
            let taker = {
                let mut meta = self.shared.meta.lock().unwrap();
                if meta.closed {
                    return Err(Closed);
                }
                meta.recv_offers.pop_front()
            };
            if let Some(taker) = taker {
                *taker.slot.lock().unwrap() = value.take();
                wake_one(taker.wait.clone());
                return Ok(true);
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Ok(false);
                }
            }

            let shared = self.shared.clone();
            let offered = value.take().unwrap();
            let rendezvous_cell: Cell<Option<Arc<Rendezvous<T>>>> = Cell::new(None);
            let rendezvous_ptr: *const Cell<Option<Arc<Rendezvous<T>>>> = &rendezvous_cell;
            let timer_cell: Cell<Option<TimerId>> = Cell::new(None);
            let timer_ptr: *const Cell<Option<TimerId>> = &timer_cell;

            scheduler::park_with(State::WaitSync, move |sched, co| {
                let node = Arc::new(WaitNode::new(co));
                let rendezvous = Arc::new(Rendezvous {
                    wait: node,
                    slot: StdMutex::new(Some(offered)),
                });
                let mut meta = shared.meta.lock().unwrap();
                if meta.closed {
                    drop(meta);
                    if let Some(co) = rendezvous.wait.try_wake() {
                        sched.dispatch(co);
                    }
                } else {
                    meta.send_offers.push_back(rendezvous.clone());
                    drop(meta);
                    if let Some(d) = deadline {
                        let id = scheduler::arm_timer(d, rendezvous.wait.clone());
                        unsafe { (*timer_ptr).set(Some(id)) };
                    }
                }
                unsafe { (*rendezvous_ptr).set(Some(rendezvous)) };
            });

            if let Some(id) = timer_cell.get() {
                scheduler::disarm_timer(id);
            }
            let rendezvous = rendezvous_cell
                .into_inner()
                .expect("park_with's publish callback always runs before resume");

            let taken = rendezvous.slot.lock().unwrap().take();
            match taken {
                None => return Ok(true),
                Some(_) => {
                    // Nobody took it: either the deadline fired or the
                    // channel closed out from under us.
                    if rendezvous.wait.outcome() == Some(Outcome::Cancelled) {
                        return Ok(false);
                    }
                    return Err(Closed);
                }
            }
        }
    }

    /// Close the channel. Further sends fail with `Err(Closed)`; pending
    /// and future receives drain whatever was already buffered, then also
    /// fail with `Err(Closed)`. Any sender or receiver parked on a
    /// rendezvous offer is woken without completing its hand-off.
    pub fn close(&self) {
        let (senders, receivers, send_offers, recv_offers) = {
            let mut meta = self.shared.meta.lock().unwrap();
            meta.closed = true;
            (
                std::mem::take(&mut meta.send_waiters),
                std::mem::take(&mut meta.recv_waiters),
                std::mem::take(&mut meta.send_offers),
                std::mem::take(&mut meta.recv_offers),
            )
        };
        for node in senders.into_iter().chain(receivers) {
            wake_one(node);
        }
        for rendezvous in send_offers.into_iter().chain(recv_offers) {
            wake_one(rendezvous.wait.clone());
        }
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Receive a value. On a buffered channel, suspends the caller only if
    /// the channel is empty; returns `Err(Closed)` once closed and fully
    /// drained. On a rendezvous channel, suspends until a sender is there
    /// to hand a value over directly; returns `Err(Closed)` immediately
    /// once closed, since there is nothing to drain.
    pub fn recv(&self) -> Result<T, Closed> {
        if self.shared.capacity == 0 {
            return self
                .recv_rendezvous(None)
                .map(|v| v.expect("an untimed rendezvous recv cannot time out"));
        }

        loop {
            {
                let mut meta = self.shared.meta.lock().unwrap();
                if let Some(v) = meta.queue.pop_front() {
                    // Popping may have freed a slot for a bounded sender.
                    let waiter = meta.send_waiters.pop_front();
                    drop(meta);
                    if let Some(node) = waiter {
                        wake_one(node);
                    }
                    return Ok(v);
                }
                if meta.closed {
                    return Err(Closed);
                }
            }

            let shared = self.shared.clone();
            scheduler::park_with(State::WaitSync, move |sched, co| {
                let node = Arc::new(WaitNode::new(co));
                let mut meta = shared.meta.lock().unwrap();
                if !meta.queue.is_empty() || meta.closed {
                    drop(meta);
                    if let Some(co) = node.try_wake() {
                        sched.dispatch(co);
                    }
                } else {
                    meta.recv_waiters.push_back(node);
                }
            });
        }
    }

    /// Like [`recv`](Receiver::recv), but gives up after `timeout`.
    /// `Ok(Some(v))` as in `recv`; `Ok(None)` means the deadline passed
    /// first; `Err(Closed)` once the channel is closed (and, for a
    /// buffered channel, drained).
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, Closed> {
        let deadline = Instant::now() + timeout;

        if self.shared.capacity == 0 {
            return self.recv_rendezvous(Some(deadline));
        }

        loop {
            {
                let mut meta = self.shared.meta.lock().unwrap();
                if let Some(v) = meta.queue.pop_front() {
                    let waiter = meta.send_waiters.pop_front();
                    drop(meta);
                    if let Some(node) = waiter {
                        wake_one(node);
                    }
                    return Ok(Some(v));
                }
                if meta.closed {
                    return Err(Closed);
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let shared = self.shared.clone();
            let node_cell: Cell<Option<Arc<WaitNode>>> = Cell::new(None);
            let node_ptr: *const Cell<Option<Arc<WaitNode>>> = &node_cell;
            let timer_cell: Cell<Option<TimerId>> = Cell::new(None);
            let timer_ptr: *const Cell<Option<TimerId>> = &timer_cell;

            scheduler::park_with(State::WaitSync, move |sched, co| {
                let node = Arc::new(WaitNode::new(co));
                let mut meta = shared.meta.lock().unwrap();
                if !meta.queue.is_empty() || meta.closed {
                    drop(meta);
                    if let Some(co) = node.try_wake() {
                        sched.dispatch(co);
                    }
                    return;
                }
                meta.recv_waiters.push_back(node.clone());
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
            if let Some(node) = node_cell.into_inner() {
                if node.outcome() == Some(Outcome::Cancelled) {
                    return Ok(None);
                }
            }
        }
    }

    /// The rendezvous-mode `recv`: match an already-waiting sender's
    /// offer directly, or park with an empty slot until one arrives (or
    /// `deadline` passes, or the channel closes).
    fn recv_rendezvous(&self, deadline: Option<Instant>) -> Result<Option<T>, Closed> {
        loop {
            let giver = {
                let mut meta = self.shared.meta.lock().unwrap();
                if meta.closed {
                    return Err(Closed);
                }
                meta.send_offers.pop_front()
            };
            if let Some(giver) = giver {
                let value = giver.slot.lock().unwrap().take();
                wake_one(giver.wait.clone());
                return Ok(value);
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Ok(None);
                }
            }

            let shared = self.shared.clone();
            let rendezvous_cell: Cell<Option<Arc<Rendezvous<T>>>> = Cell::new(None);
            let rendezvous_ptr: *const Cell<Option<Arc<Rendezvous<T>>>> = &rendezvous_cell;
            let timer_cell: Cell<Option<TimerId>> = Cell::new(None);
            let timer_ptr: *const Cell<Option<TimerId>> = &timer_cell;

            scheduler::park_with(State::WaitSync, move |sched, co| {
                let node = Arc::new(WaitNode::new(co));
                let rendezvous = Arc::new(Rendezvous {
                    wait: node,
                    slot: StdMutex::new(None),
                });
                let mut meta = shared.meta.lock().unwrap();
                if meta.closed {
                    drop(meta);
                    if let Some(co) = rendezvous.wait.try_wake() {
                        sched.dispatch(co);
                    }
                } else {
                    meta.recv_offers.push_back(rendezvous.clone());
                    drop(meta);
                    if let Some(d) = deadline {
                        let id = scheduler::arm_timer(d, rendezvous.wait.clone());
                        unsafe { (*timer_ptr).set(Some(id)) };
                    }
                }
                unsafe { (*rendezvous_ptr).set(Some(rendezvous)) };
            });

            if let Some(id) = timer_cell.get() {
                scheduler::disarm_timer(id);
            }
            let rendezvous = rendezvous_cell
                .into_inner()
                .expect("park_with's publish callback always runs before resume");

            let taken = rendezvous.slot.lock().unwrap().take();
            match taken {
                Some(v) => return Ok(Some(v)),
                None => {
                    if rendezvous.wait.outcome() == Some(Outcome::Cancelled) {
                        return Ok(None);
                    }
                    return Err(Closed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fleet;
    use std::sync::mpsc::channel as std_channel;
    use std::time::Duration;

    #[test]
    fn send_then_recv_round_trips() {
        let (tx, rx) = channel::<u32>(4);
        let (done_tx, done_rx) = std_channel();

        fleet::go(move || {
            tx.send(7).unwrap();
        });
        fleet::go(move || {
            let v = rx.recv().unwrap();
            done_tx.send(v).unwrap();
        });

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    }

    #[test]
    fn recv_drains_backlog_before_reporting_closed() {
        let (tx, rx) = channel::<u32>(2);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.close();

        assert_eq!(rx.recv(), Ok(1));
        assert_eq!(rx.recv(), Ok(2));
        assert_eq!(rx.recv(), Err(Closed));
    }

    #[test]
    fn send_after_close_errors() {
        let (tx, _rx) = channel::<u32>(0);
        tx.close();
        assert_eq!(tx.send(1), Err(Closed));
    }

    #[test]
    fn recv_timeout_returns_none_when_nothing_arrives() {
        let (_tx, rx) = channel::<u32>(0);
        let (done_tx, done_rx) = std_channel();
        fleet::go(move || {
            done_tx.send(rx.recv_timeout(Duration::from_millis(20))).unwrap();
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(None));
    }

    #[test]
    fn send_timeout_returns_false_when_bounded_channel_stays_full() {
        let (tx, _rx) = channel::<u32>(1);
        tx.send(1).unwrap();
        let (done_tx, done_rx) = std_channel();
        fleet::go(move || {
            done_tx.send(tx.send_timeout(2, Duration::from_millis(20))).unwrap();
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(false));
    }

    #[test]
    fn rendezvous_send_never_buffers_ahead_of_a_receiver() {
        // capacity 0: send() must not return until a recv() actually takes
        // the value, so a standalone send with nobody waiting never
        // completes synchronously on its own coroutine.
        let (tx, rx) = channel::<u32>(0);
        let (order_tx, order_rx) = std_channel();

        fleet::go(move || {
            tx.send(42).unwrap();
            order_tx.send("sent").unwrap();
        });

        // Give the sender a chance to run first; it must still be parked
        // (no queue to have buffered into) since nobody has received yet.
        std::thread::sleep(Duration::from_millis(20));
        assert!(order_rx.try_recv().is_err(), "send completed with no receiver present");

        let (value_tx, value_rx) = std_channel();
        fleet::go(move || {
            value_tx.send(rx.recv().unwrap()).unwrap();
        });

        assert_eq!(value_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        assert_eq!(order_rx.recv_timeout(Duration::from_secs(2)).unwrap(), "sent");
    }

    #[test]
    fn rendezvous_recv_matches_a_waiting_sender_offer() {
        let (tx, rx) = channel::<u32>(0);
        let (done_tx, done_rx) = std_channel();

        fleet::go(move || {
            done_tx.send(rx.recv().unwrap()).unwrap();
        });
        fleet::go(move || {
            tx.send(9).unwrap();
        });

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 9);
    }
}
