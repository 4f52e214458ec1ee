// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `coflow`: a stackful, M:N-scheduled coroutine runtime.
//!
//! A process-wide fleet of schedulers (one OS thread and one I/O
//! multiplexer each) runs stackful coroutines cooperatively. [`go`] spawns
//! one onto the fleet; [`net`] gives it cooperative sockets; [`sync`] gives
//! it coroutine-aware `Mutex`/`Event`/`WaitGroup`/channel/`Pool` primitives
//! that suspend the caller instead of blocking its OS thread.
//!
//! ```no_run
//! fn main() {
//!     coflow::main_scheduler().run(|| {
//!         let handle = coflow::go(|| 1 + 1);
//!         assert_eq!(handle.join().unwrap(), 2);
//!     });
//! }
//! ```

pub mod alloc;
pub mod coroutine;
pub mod error;
pub mod io;
pub mod join;
pub mod net;
pub mod options;
pub mod runtime;
pub mod sync;
pub mod timer;

use std::sync::OnceLock;

pub use coroutine::{CoroutineId, State};
pub use join::JoinHandle;
pub use runtime::scheduler::{Handle as Scheduler, SchedulerId};

/// Spawn a coroutine. Placed on the scheduler it is spawned from if one is
/// running on the current thread, or round-robined across the fleet
/// otherwise. See `runtime::fleet::go`.
pub fn go<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    runtime::fleet::go(f)
}

/// Like [`go`], with explicit spawn [`options::Options`] (name, stack size).
pub fn spawn_opts<F, T>(opts: options::Options, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    runtime::fleet::spawn_opts(opts, f)
}

/// Yield the calling coroutine back to its scheduler, letting any other
/// runnable coroutine take a turn before it resumes.
///
/// Panics if called outside of a coroutine, same as every other suspension
/// point in the runtime.
pub fn yield_now() {
    coroutine::yield_raw(State::Runnable, 0);
}

/// Suspend the calling coroutine for `duration`, or — if `Config::disable_hook_sleep`
/// was set for its scheduler — just [`yield_now`] once. See [`net::sleep`].
pub fn sleep(duration: std::time::Duration) -> std::io::Result<()> {
    net::sleep(duration)
}

/// The identifier of the coroutine currently running on this OS thread.
///
/// Panics outside of a coroutine — there is nothing to identify.
pub fn coroutine_id() -> CoroutineId {
    coroutine::current()
        .expect("coroutine_id() called outside of a coroutine")
        .id()
}

/// The identifier of the scheduler running on this OS thread.
///
/// Panics outside of a scheduler thread.
pub fn scheduler_id() -> SchedulerId {
    runtime::scheduler::current_handle()
        .expect("scheduler_id() called outside of a scheduler thread")
        .id()
}

/// Every scheduler in the process-wide fleet, in construction order.
pub fn all_schedulers() -> &'static [Scheduler] {
    runtime::fleet::all_schedulers()
}

/// Number of schedulers in the fleet.
pub fn scheduler_num() -> usize {
    runtime::fleet::scheduler_count()
}

static MAIN_SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// The fleet's first scheduler, by construction order.
///
/// Intended as the runtime's entry point from a plain `main`:
/// `coflow::main_scheduler().run(|| { .. })` spawns the closure as a
/// coroutine pinned to this scheduler and blocks the calling OS thread
/// (via [`JoinHandle::join_blocking`]) until it finishes.
pub fn main_scheduler() -> &'static Scheduler {
    MAIN_SCHEDULER.get_or_init(runtime::fleet::first_scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_scheduler_is_stable_across_calls() {
        assert_eq!(main_scheduler().id(), main_scheduler().id());
    }

    #[test]
    fn run_blocks_until_the_coroutine_finishes() {
        let result = main_scheduler().run(|| {
            let inner = go(|| coroutine_id());
            inner.join().unwrap();
            1 + 1
        });
        assert_eq!(result, 2);
    }

    #[test]
    fn yield_now_panics_outside_a_coroutine() {
        let result = std::panic::catch_unwind(|| yield_now());
        assert!(result.is_err());
    }
}
