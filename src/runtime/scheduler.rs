// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A single scheduler: one OS thread, one I/O multiplexer, one timer wheel,
//! one FIFO ready queue, one inbound task queue.
//!
//! Grounded on the teacher's `Processor` (`runtime/processor.rs`, retired
//! once this module fully superseded it) for the overall shape — a
//! thread-pinned run loop
//! driven from a `thread_local`, a cross-thread handle `Clone`-able into
//! other coroutines' hands, `park_with` for race-free suspension — but
//! restructured around spec.md §4.2's design, which is not what the teacher
//! does:
//!
//! * The teacher runs ONE global `mio::EventLoop` on its own dedicated
//!   thread and farms ready coroutines out to N separate `Processor`
//!   threads that never touch I/O directly. spec.md §1 instead gives each
//!   scheduler its own multiplexer, so here the `EventLoop` runs on the
//!   same thread as the ready queue it feeds; registering/deregistering an
//!   fd is a same-thread call, not a message sent to a separate reactor.
//! * The teacher's `Processor`s steal work from each other via a
//!   `deque::Worker`/`Stealer` pair (one of the pack's sibling coio-rs
//!   forks shows the same pattern at the top-level `Scheduler`).
//!   spec.md §4.2 is explicit that fairness is FIFO-only, with no
//!   stealing after a coroutine is placed on a scheduler — so the ready
//!   queue here is a plain `VecDeque`, and the `deque`/`rand` crates the
//!   teacher pulls in for stealing are dropped (see DESIGN.md).

use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use context::stack::ProtectedFixedSizeStack;
use mio::{EventLoop, EventSet, Handler, PollOpt, Token};
use slab::Slab;

use crate::alloc::StackArena;
use crate::coroutine::{self, Coroutine, State};
use crate::options::Config;
use crate::sync::waitnode::WaitNode;
use crate::timer::{TimerId, Wheel};

/// Upper bound on how long a scheduler blocks in a single `mio` poll when
/// idle, so a dropped wakeup notification never stalls it for longer than
/// this. spec.md §4.2's "tick_ceiling".
const TICK_CEILING: Duration = Duration::from_millis(20);

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulerId(usize);

impl SchedulerId {
    /// A raw, process-wide-unique number for use as a lightweight owner tag
    /// (e.g. `io`'s fd-direction single-owner table) without handing out a
    /// full `Handle`.
    pub fn raw(&self) -> usize {
        self.0
    }
}

/// Sent through the `mio::EventLoop`'s own channel purely to break it out of
/// a blocking poll; the inbound coroutine queue is a separate
/// `std::sync::mpsc` channel, so a burst of wakeups doesn't have to pay for
/// `mio`'s heavier notify path per coroutine.
enum Wake {
    Poke,
}

/// State a scheduler thread owns outright: never touched by any other
/// thread. Reached only through the `CURRENT` thread-local raw pointer
/// while the owning thread is inside [`run`].
struct Local {
    ready: VecDeque<coroutine::Handle>,
    waiters: Slab<Arc<WaitNode>>,
    timers: Wheel<Arc<WaitNode>>,
    stacks: StackArena,
    event_loop: EventLoop<SchedulerLoop>,
    disable_hook_sleep: bool,
    /// Run once, in registration order, after this scheduler's run loop has
    /// stopped for good. `sync::pool::Pool`'s per-scheduler partitions use
    /// this to invoke their destroy callback on every entry still idle at
    /// teardown, per spec.md §4.5.
    on_teardown: Vec<Box<dyn FnOnce()>>,
}

thread_local! {
    static CURRENT: Cell<*mut Local> = Cell::new(std::ptr::null_mut());
    static SCHED_HANDLE: std::cell::RefCell<Option<Handle>> = std::cell::RefCell::new(None);
}

fn with_local<R>(f: impl FnOnce(&mut Local) -> R) -> R {
    CURRENT.with(|cur| {
        let ptr = cur.get();
        assert!(!ptr.is_null(), "not running on a scheduler thread");
        f(unsafe { &mut *ptr })
    })
}

/// The part of a scheduler safe to share across threads: an id, a sender
/// into the inbound queue, a way to nudge the multiplexer awake, and the
/// (locked) staging area cross-thread `Coroutine` drops return stacks
/// through.
struct Inner {
    id: SchedulerId,
    inbound_tx: mpsc::Sender<coroutine::Handle>,
    wake_tx: Mutex<mio::Sender<Wake>>,
    stacks_remote: Mutex<Vec<ProtectedFixedSizeStack>>,
    stopping: AtomicBool,
}

/// A cloneable, `Send + Sync` reference to a running scheduler.
#[derive(Clone)]
pub struct Handle(Arc<Inner>);

/// A non-owning reference to a scheduler, stored on every [`Coroutine`] so
/// wakeups originating on a foreign thread know where to deliver it.
#[derive(Clone)]
pub struct WeakHandle(Option<Weak<Inner>>);

impl WeakHandle {
    /// A handle that never upgrades — used for coroutines spawned without a
    /// scheduler (unit tests, a bare `Coroutine::spawn` in isolation).
    pub fn none() -> WeakHandle {
        WeakHandle(None)
    }

    pub fn upgrade(&self) -> Option<Handle> {
        self.0.as_ref().and_then(Weak::upgrade).map(Handle)
    }
}

impl Handle {
    pub fn id(&self) -> SchedulerId {
        self.0.id
    }

    pub fn downgrade(&self) -> WeakHandle {
        WeakHandle(Some(Arc::downgrade(&self.0)))
    }

    /// Hand a runnable coroutine to this scheduler. Safe to call from any
    /// thread — this is the only cross-thread entry point into a running
    /// scheduler.
    pub fn dispatch(&self, co: coroutine::Handle) {
        if self.0.inbound_tx.send(co).is_err() {
            // Scheduler thread is gone; `co` is dropped right here, which
            // returns its stack via `Coroutine::drop` -> `release_stack`.
            return;
        }
        let _ = self.0.wake_tx.lock().unwrap().send(Wake::Poke);
    }

    /// Return a stack to this scheduler's arena. Called by `Coroutine::drop`,
    /// which may run on any thread, so this always goes through the locked
    /// remote-return list rather than touching the arena directly.
    pub fn release_stack(&self, stack: ProtectedFixedSizeStack) {
        self.0.stacks_remote.lock().unwrap().push(stack);
    }

    pub fn request_stop(&self) {
        self.0.stopping.store(true, Ordering::SeqCst);
        let _ = self.0.wake_tx.lock().unwrap().send(Wake::Poke);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scheduler::Handle({})", self.0.id.0)
    }
}

/// Registration token for an `mio`-backed readiness wait.
pub type IoToken = Token;

/// The handler `mio::EventLoop` dispatches into. Thin: everything it needs
/// lives in `Local`, reached through the owning thread's `CURRENT` pointer.
struct SchedulerLoop;

impl Handler for SchedulerLoop {
    type Timeout = ();
    type Message = Wake;

    fn ready(&mut self, _event_loop: &mut EventLoop<SchedulerLoop>, token: Token, _events: EventSet) {
        with_local(|local| {
            if let Some(node) = local.waiters.get(token.as_usize()) {
                if let Some(co) = node.try_wake() {
                    local.ready.push_back(co);
                }
            }
        });
    }

    fn notify(&mut self, _event_loop: &mut EventLoop<SchedulerLoop>, _msg: Wake) {
        // No-op by design: delivering the message already broke `run_once`
        // out of its blocking poll, which is the only thing a notify needs
        // to accomplish here.
    }
}

/// Register interest in an `mio::Evented` on the scheduler running on this
/// thread, returning a token used later to `reregister`/`deregister` it.
/// Must be called from inside a running scheduler — panics otherwise,
/// mirroring `coroutine::yield_raw`'s "no parent context" panic.
pub fn register<E: mio::Evented>(io: &E, interest: EventSet, node: Arc<WaitNode>) -> io::Result<IoToken> {
    with_local(|local| {
        let token = Token(local.waiters.insert(node));
        local.event_loop.register(io, token, interest, PollOpt::edge())?;
        Ok(token)
    })
}

pub fn reregister<E: mio::Evented>(io: &E, token: IoToken, interest: EventSet) -> io::Result<()> {
    with_local(|local| local.event_loop.reregister(io, token, interest, PollOpt::edge()))
}

pub fn deregister<E: mio::Evented>(io: &E, token: IoToken) -> io::Result<()> {
    with_local(|local| {
        local.waiters.remove(token.as_usize());
        local.event_loop.deregister(io)
    })
}

/// Arm a one-shot timer on the current scheduler's wheel; `node` is the
/// same wait node registered with whatever else (I/O, a sync primitive)
/// the coroutine is racing the timeout against.
pub fn arm_timer(deadline: Instant, node: Arc<WaitNode>) -> TimerId {
    with_local(|local| local.timers.insert(deadline, node))
}

pub fn disarm_timer(id: TimerId) {
    with_local(|local| {
        local.timers.cancel(id);
    });
}

/// Register a callback to run once, after this scheduler's run loop has
/// exited for good. Only valid to call while running on a scheduler thread.
pub fn register_teardown(f: impl FnOnce() + 'static) {
    with_local(|local| local.on_teardown.push(Box::new(f)));
}

/// The `Handle` of the scheduler running on this thread, if any. Used by
/// `go()` to default a freshly spawned coroutine onto its spawning
/// scheduler, and by sync primitives that need to know "who do I belong to".
pub fn current_handle() -> Option<Handle> {
    SCHED_HANDLE.with(|h| h.borrow().clone())
}

/// Whether the current scheduler was configured with `disable_hook_sleep`,
/// per `Config`. `net::sleep` uses this to fall back to a plain
/// `yield_now()` for tests that don't want wall-clock waits.
pub fn hook_sleep_disabled() -> bool {
    with_local(|local| local.disable_hook_sleep)
}

/// Suspend the running coroutine, recording `state`, then invoke `publish`
/// with the owning scheduler and the now-fully-suspended coroutine handle —
/// exactly once, and only after the context switch back to the scheduler
/// has completed.
///
/// This is the race-free publication point spec.md §3 calls for: `publish`
/// is where a wait node actually gets registered into a mutex's waiter
/// list, an fd's waiter slot, or the timer wheel, guaranteeing nobody can
/// observe the coroutine as "waiting" before it has actually stopped
/// running. Grounded on the teacher's `Processor::park_with`, generalized
/// from "push onto this specific `Processor`'s queue" to an arbitrary
/// caller-supplied callback.
pub fn park_with<'a, F>(state: State, publish: F) -> usize
where
    F: FnOnce(Handle, coroutine::Handle) + 'a,
{
    // SAFETY: `publish` is invoked synchronously from `resume_one`, inside
    // the very call to `Coroutine::resume` that this function's
    // `yield_raw` suspends — i.e. strictly before the now-suspended
    // coroutine's stack (which `publish`'s captures typically borrow from,
    // e.g. a socket local to the `net::` call that's parking) could be
    // unwound or reused. The thread-local below never holds the box past
    // that single hand-off.
    let boxed: Box<dyn FnOnce(Handle, coroutine::Handle) + 'a> = Box::new(publish);
    let boxed: Box<dyn FnOnce(Handle, coroutine::Handle) + 'static> =
        unsafe { std::mem::transmute(boxed) };
    PENDING.with(|p| {
        *p.borrow_mut() = Some(boxed);
    });
    coroutine::yield_raw(state, 0)
}

thread_local! {
    static PENDING: std::cell::RefCell<Option<Box<dyn FnOnce(Handle, coroutine::Handle)>>> =
        std::cell::RefCell::new(None);
}

/// Run a scheduler on the current thread until [`Handle::request_stop`] has
/// been called and the ready queue, inbound queue, and timer wheel have all
/// drained empty.
///
/// Grounded on the teacher's `Processor::schedule` main loop: pop ready,
/// resume, handle the return state, poll for I/O with a deadline-bounded
/// timeout, expire timers. Reordered per spec.md §4.2's step list, with
/// stealing removed (see module docs).
fn run(cfg: Config, inbound_rx: mpsc::Receiver<coroutine::Handle>, inner: Arc<Inner>) {
    let event_loop = EventLoop::new().expect("failed to create scheduler event loop");
    *inner.wake_tx.lock().unwrap() = event_loop.channel();

    let handle = Handle(inner.clone());
    SCHED_HANDLE.with(|h| *h.borrow_mut() = Some(handle.clone()));

    let mut local = Local {
        ready: VecDeque::new(),
        waiters: Slab::new(),
        timers: Wheel::new(),
        stacks: StackArena::new(cfg.stack_size),
        event_loop,
        disable_hook_sleep: cfg.disable_hook_sleep,
        on_teardown: Vec::new(),
    };
    CURRENT.with(|cur| cur.set(&mut local));

    let mut handler = SchedulerLoop;

    loop {
        {
            let mut remote = inner.stacks_remote.lock().unwrap();
            for stack in remote.drain(..) {
                local.stacks.release(stack);
            }
        }

        while let Ok(co) = inbound_rx.try_recv() {
            local.ready.push_back(co);
        }

        if inner.stopping.load(Ordering::SeqCst) && local.ready.is_empty() && local.timers.is_empty() {
            break;
        }

        // Run every currently-ready coroutine once before touching I/O
        // again, so a burst of wakeups can't starve the multiplexer.
        let runnable = std::mem::take(&mut local.ready);
        for mut co in runnable {
            resume_one(&mut local, &handle, &mut co);
        }

        // Coroutines resumed above may have re-enqueued themselves (a
        // `yield_now()`, a newly dispatched child) and cross-thread senders
        // may have pushed more work onto the inbound queue while we were
        // busy running that batch. Either makes blocking in `run_once`
        // wrong, per spec.md §4.2 step 1: poll with a 0 timeout whenever
        // there's ready work waiting, not just when a timer says so.
        while let Ok(co) = inbound_rx.try_recv() {
            local.ready.push_back(co);
        }

        let now = Instant::now();
        let timeout = if !local.ready.is_empty() {
            Duration::from_millis(0)
        } else {
            match local.timers.next_deadline() {
                Some(deadline) if deadline > now => (deadline - now).min(TICK_CEILING),
                Some(_) => Duration::from_millis(0),
                None => TICK_CEILING,
            }
        };

        let _ = local
            .event_loop
            .run_once(&mut handler, Some(timeout.as_millis() as usize));

        let now = Instant::now();
        let expired = local.timers.expire_before(now);
        for (_, node) in expired {
            if let Some(co) = node.try_cancel() {
                local.ready.push_back(co);
            }
        }
    }

    for teardown in local.on_teardown.drain(..) {
        teardown();
    }

    CURRENT.with(|cur| cur.set(std::ptr::null_mut()));
    SCHED_HANDLE.with(|h| *h.borrow_mut() = None);
}

/// Resume a single coroutine for one scheduling quantum and route it to
/// wherever it belongs afterwards: back onto the ready queue if it merely
/// yielded, nowhere if it suspended itself (the `park_with` callback already
/// filed it), or nowhere if it finished (its stack returns via `Drop`).
fn resume_one(local: &mut Local, _handle: &Handle, co: &mut coroutine::Handle) {
    if co.needs_stack() {
        let stack = local
            .stacks
            .acquire_sized(co.stack_size())
            .unwrap_or_else(|e| crate::error::abort_process("allocating a coroutine stack", &e));
        co.bind_stack(stack);
    }

    co.set_state(State::Running);
    co.resume(0);

    if co.is_dead() {
        co.finish();
        return;
    }

    match co.state() {
        State::Runnable => {
            let owned = std::mem::replace(co, placeholder());
            local.ready.push_back(owned);
        }
        State::WaitIo | State::WaitTimer | State::WaitSync => {
            let publish = PENDING.with(|p| p.borrow_mut().take());
            if let Some(publish) = publish {
                let owned = std::mem::replace(co, placeholder());
                let handle = SCHED_HANDLE
                    .with(|h| h.borrow().clone())
                    .expect("scheduler handle missing inside its own run loop");
                publish(handle, owned);
            }
        }
        State::Init | State::Running | State::Dead => {
            unreachable!("resume() cannot leave a coroutine in {:?}", co.state())
        }
    }
}

/// A throwaway coroutine used purely to satisfy ownership during
/// `mem::replace` in `resume_one`. Never resumed, so its stack is never
/// bound — nothing to allocate here.
fn placeholder() -> coroutine::Handle {
    Coroutine::spawn(Box::new(|| {}), crate::options::MIN_STACK_SIZE, WeakHandle::none(), None)
}

/// Spawn a scheduler on a fresh OS thread, returning a handle to it and its
/// `JoinHandle` for explicit, non-leaking teardown (see
/// `runtime::fleet::Fleet::shutdown`).
pub fn spawn(cfg: Config) -> (Handle, JoinHandle<()>) {
    let id = SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::channel();

    let inner = Arc::new(Inner {
        id,
        inbound_tx: tx,
        wake_tx: Mutex::new(placeholder_wake_sender()),
        stacks_remote: Mutex::new(Vec::new()),
        stopping: AtomicBool::new(false),
    });

    let thread_inner = inner.clone();
    let join = thread::Builder::new()
        .name(format!("coflow-sched-{}", id.0))
        .spawn(move || run(cfg, rx, thread_inner))
        .expect("failed to spawn scheduler thread");

    (Handle(inner), join)
}

/// A throwaway `EventLoop` purely to mint a `Sender` so `Inner::wake_tx` has
/// something valid to hold until the scheduler thread installs its own.
/// Never driven; replaced before the scheduler thread's first poll.
fn placeholder_wake_sender() -> mio::Sender<Wake> {
    EventLoop::<SchedulerLoop>::new()
        .expect("failed to create placeholder event loop")
        .channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel as std_channel;
    use std::time::Duration;

    #[test]
    fn scheduler_runs_a_dispatched_coroutine_to_completion() {
        let (handle, join) = spawn(Config::default());
        let (tx, rx) = std_channel();

        let weak = handle.downgrade();
        let co = Coroutine::spawn(
            Box::new(move || {
                tx.send(()).unwrap();
            }),
            crate::options::MIN_STACK_SIZE,
            weak,
            Some("smoke".into()),
        );

        handle.dispatch(co);
        rx.recv_timeout(Duration::from_secs(2)).expect("coroutine should run");

        handle.request_stop();
        join.join().unwrap();
    }
}
