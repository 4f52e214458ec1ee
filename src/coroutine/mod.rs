// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The stackful coroutine frame and its context switch.
//!
//! Grounded on the `context`-crate lineage shared by the teacher
//! (`coio-rs` depends on `context = "1.0"`) and several independent forks
//! in the corpus (`coroutine-rs`'s `coroutine_unique.rs`, `nemo`'s
//! `coroutine/unique.rs`): a coroutine is a `(stack, saved context)` pair,
//! and the per-architecture register swap is implemented by the `context`
//! crate, not by this crate. What's here is the bookkeeping the upstream
//! `co` library calls a "coroutine frame": state, id, name, the owning
//! scheduler back-reference, and the panic payload a dead coroutine may be
//! carrying for its `JoinHandle`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::runtime::scheduler::WeakHandle;

/// State of a coroutine, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Allocated but never scheduled.
    Init,
    /// On a ready deque, waiting for its scheduler to swap in.
    Runnable,
    /// Currently executing on its owning scheduler's thread.
    Running,
    /// Suspended on a hooked I/O call, waiting for readiness.
    WaitIo,
    /// Suspended on `sleep`/a timeout, waiting for the timer wheel.
    WaitTimer,
    /// Suspended on a sync primitive (mutex/event/wait-group/channel/pool).
    WaitSync,
    /// Finished (normally or via panic). Terminal.
    Dead,
}

/// Process-wide-unique identifier for observability (`coroutine_id()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(u64);

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co-{}", self.0)
    }
}

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

fn next_coroutine_id() -> CoroutineId {
    CoroutineId(NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed))
}

/// A boxed, type-erased coroutine body.
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// The context a running coroutine resumes to yield back to its scheduler,
/// and the `Coroutine*` currently executing on this OS thread.
///
/// These are thread-locals, not fields on `Coroutine`, because arbitrary
/// code running deep inside a coroutine's call stack (a `Mutex::lock` slow
/// path three frames down) needs to yield without anyone threading a
/// `Context` through every call site — exactly the problem the teacher
/// solves with its own `Environment::coroutine_stack` thread-local.
thread_local! {
    static PARENT: RefCell<Option<Context>> = RefCell::new(None);
    static CURRENT: Cell<*mut Coroutine> = Cell::new(std::ptr::null_mut());
}

/// A heap-allocated coroutine frame, exclusively owned by its scheduler.
pub struct Coroutine {
    /// `None` until the stack is bound (see [`Coroutine::bind_stack`]), and
    /// while the coroutine is actually running (the context has been handed
    /// to the CPU); `Some` once suspended, holding the continuation the
    /// scheduler resumes into.
    context: Option<Context>,
    /// `None` until a scheduler calls `bind_stack` on this coroutine's first
    /// resume. Spawning never allocates a stack — per spec.md §4.6, `go`
    /// must neither block nor allocate; the owning scheduler binds one
    /// lazily out of its own arena the first time it actually resumes this
    /// coroutine.
    stack: Option<ProtectedFixedSizeStack>,
    stack_size: usize,
    state: State,
    id: CoroutineId,
    name: Option<String>,
    scheduler: WeakHandle,
    panic: Option<Box<dyn Any + Send + 'static>>,
    /// The leaked entry-closure pointer, consumed by the very first `resume`.
    pending_entry: Option<usize>,
    /// Run once, by `resume_one`, the moment this coroutine is found dead.
    /// `go()`'s `JoinHandle` plumbing is the only current user: a normal
    /// return is recorded directly from inside the body, so this only has
    /// work to do when `take_panic` comes back `Some`.
    on_finish: Option<Box<dyn FnOnce(Option<Box<dyn Any + Send + 'static>>) + Send + 'static>>,
}

unsafe impl Send for Coroutine {}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Coroutine(`{}`, {:?})",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.state
        )
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        if let (Some(stack), Some(sched)) = (self.stack.take(), self.scheduler.upgrade()) {
            sched.release_stack(stack);
        }
    }
}

/// An owning pointer to a coroutine frame. Exclusively held by the
/// scheduler's queues (ready deque / inbound queue / a sync primitive's
/// waiter list) at any given moment, per spec.md §3's single-ownership
/// invariant.
pub struct Handle(Box<Coroutine>);

unsafe impl Send for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::ops::Deref for Handle {
    type Target = Coroutine;
    fn deref(&self) -> &Coroutine {
        &self.0
    }
}

impl std::ops::DerefMut for Handle {
    fn deref_mut(&mut self) -> &mut Coroutine {
        &mut self.0
    }
}

extern "C" fn trampoline(t: Transfer) -> ! {
    PARENT.with(|p| *p.borrow_mut() = Some(t.context));

    // `t.data` is the leaked pointer to the boxed entry closure, stashed by
    // `Coroutine::spawn` before the very first resume.
    let entry: Box<Entry> = unsafe { Box::from_raw(t.data as *mut Entry) };

    let result = panic::catch_unwind(AssertUnwindSafe(move || (*entry)()));

    CURRENT.with(|cur| {
        let coro = unsafe { &mut *cur.get() };
        coro.state = State::Dead;
        if let Err(payload) = result {
            coro.panic = Some(payload);
        }
    });

    // Dead coroutines must never run user code again. Any further resume
    // (a stray wakeup racing teardown) just bounces straight back.
    loop {
        yield_raw(State::Dead, 0);
    }
}

/// Yield the currently running coroutine back to its scheduler, recording
/// `state` and passing `data` through to whatever called `Coroutine::resume`.
///
/// Panics if called outside of a coroutine (there's no parent context to
/// swap into) — matching the teacher's "cannot yield with Running state"
/// class of usage-error assertions.
pub fn yield_raw(state: State, data: usize) -> usize {
    CURRENT.with(|cur| {
        let coro = unsafe { cur.get().as_mut() };
        if let Some(coro) = coro {
            coro.state = state;
        }
    });

    let parent = PARENT
        .with(|p| p.borrow_mut().take())
        .expect("yield_raw called outside of a coroutine");

    let transfer = unsafe { parent.resume(data) };
    PARENT.with(|p| *p.borrow_mut() = Some(transfer.context));
    transfer.data
}

/// The `Coroutine*` currently running on this OS thread, if any.
pub fn current() -> Option<&'static Coroutine> {
    CURRENT.with(|cur| unsafe { cur.get().as_ref() })
}

impl Coroutine {
    /// Fabricate a coroutine with no stack yet, ready to be dispatched onto
    /// a scheduler's ready/inbound queue. `stack_size` records what size to
    /// request once a scheduler actually binds one (see
    /// [`Coroutine::bind_stack`]) — spawning itself never touches an arena.
    ///
    /// The entry closure is boxed twice (`Entry` then leaked as a raw
    /// pointer) and handed across the very first context switch as the
    /// `usize` data word, exactly as `examples/other_examples/d062e437_*`'s
    /// `coroutine_initialize` receives its thunk.
    pub fn spawn(f: Entry, stack_size: usize, scheduler: WeakHandle, name: Option<String>) -> Handle {
        let boxed_entry: Box<Entry> = Box::new(f);
        let entry_ptr = Box::into_raw(boxed_entry) as usize;

        Handle(Box::new(Coroutine {
            context: None,
            stack: None,
            stack_size,
            state: State::Init,
            id: next_coroutine_id(),
            name,
            scheduler,
            panic: None,
            pending_entry: Some(entry_ptr),
            on_finish: None,
        }))
    }

    /// Whether this coroutine still needs a stack bound before it can be
    /// resumed — true from `spawn` until the owning scheduler's first
    /// `resume` of it.
    #[inline]
    pub fn needs_stack(&self) -> bool {
        self.stack.is_none()
    }

    /// The stack size this coroutine was spawned with, for whichever
    /// scheduler ends up binding its stack to request the right size from
    /// its arena.
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Bind `stack` to this coroutine and build its initial context.
    /// Must be called exactly once, before the first `resume`.
    pub fn bind_stack(&mut self, stack: ProtectedFixedSizeStack) {
        debug_assert!(self.stack.is_none(), "stack already bound");
        self.context = Some(unsafe { Context::new(&stack, trampoline) });
        self.stack = Some(stack);
    }

    /// Install the callback `resume_one` runs once this coroutine is found
    /// dead, receiving its panic payload if it has one.
    pub fn set_on_finish<F>(&mut self, f: F)
    where
        F: FnOnce(Option<Box<dyn Any + Send + 'static>>) + Send + 'static,
    {
        self.on_finish = Some(Box::new(f));
    }

    /// Run and clear the `on_finish` hook, if one was installed, handing it
    /// the panic payload captured at the trampoline (if any). A no-op for
    /// coroutines spawned without `set_on_finish`.
    pub fn finish(&mut self) {
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(self.panic.take());
        }
    }

    /// Resume this coroutine. Must only ever be called by its owning
    /// scheduler's thread. `data` is handed to the coroutine as the return
    /// value of whatever `yield_raw`/trampoline call suspended it; the
    /// return value is whatever the coroutine passed to its own next
    /// `yield_raw`.
    pub fn resume(&mut self, data: usize) -> usize {
        debug_assert_ne!(self.state, State::Dead, "cannot resume a dead coroutine");

        let first_run = self.pending_entry.take();
        let ctx = self
            .context
            .take()
            .expect("coroutine is already running, or resumed before its stack was bound");
        self.state = State::Running;

        let self_ptr: *mut Coroutine = self;
        let prev = CURRENT.with(|cur| cur.replace(self_ptr));

        let transfer = unsafe { ctx.resume(first_run.unwrap_or(data)) };

        CURRENT.with(|cur| cur.set(prev));
        self.context = Some(transfer.context);
        transfer.data
    }

    #[inline]
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state == State::Dead
    }

    /// Take the panic payload left behind by a coroutine that panicked,
    /// for delivery through its `JoinHandle`.
    pub fn take_panic(&mut self) -> Option<Box<dyn Any + Send + 'static>> {
        self.panic.take()
    }

    #[inline]
    pub fn scheduler(&self) -> &WeakHandle {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scheduler::WeakHandle;
    use std::sync::mpsc::channel;

    fn spawn_detached(f: Entry) -> Handle {
        let mut co = Coroutine::spawn(f, crate::options::MIN_STACK_SIZE, WeakHandle::none(), None);
        let stack = ProtectedFixedSizeStack::new(crate::options::MIN_STACK_SIZE).unwrap();
        co.bind_stack(stack);
        co
    }

    #[test]
    fn runs_to_completion() {
        let (tx, rx) = channel();
        let mut coro = spawn_detached(Box::new(move || {
            tx.send(1).unwrap();
        }));
        coro.resume(0);
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(coro.is_dead());
    }

    #[test]
    fn yields_and_resumes() {
        let (tx, rx) = channel();
        let mut coro = spawn_detached(Box::new(move || {
            tx.send(1).unwrap();
            yield_raw(State::Runnable, 0);
            tx.send(2).unwrap();
        }));

        coro.resume(0);
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(coro.state(), State::Runnable);

        coro.resume(0);
        assert_eq!(rx.recv().unwrap(), 2);
        assert!(coro.is_dead());
    }

    #[test]
    fn captures_panic_payload() {
        let mut coro = spawn_detached(Box::new(|| panic!("boom")));
        coro.resume(0);
        assert!(coro.is_dead());
        let payload = coro.take_panic().expect("panic payload expected");
        assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");
    }

    #[test]
    fn resume_after_finished_is_a_noop_via_dead_loop() {
        let mut coro = spawn_detached(Box::new(|| {}));
        coro.resume(0);
        assert!(coro.is_dead());
        // A second resume would violate the debug assertion; dead
        // coroutines are expected to be dropped, not resumed again.
    }
}
