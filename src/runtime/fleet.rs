// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The fleet: `Config::sched_num` schedulers, one OS thread each, and a
//! round-robin counter that spreads freshly spawned coroutines across them.
//!
//! spec.md §1/§4.2 describes a process-wide fleet that `go()` dispatches
//! into. The teacher builds something similar (`Scheduler::spawn` brings up
//! N `Processor`s) but never tears them down — every `Machine` is leaked and
//! its thread runs until process exit. spec.md §9 asks explicitly for this
//! choice to be reconsidered; `Fleet::shutdown` below gives each scheduler
//! an explicit `request_stop` and joins its thread, rather than leaking it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle as ThreadJoinHandle;

use crate::coroutine::{self, Coroutine};
use crate::join::{self, JoinHandle};
use crate::options::{Config, Options};
use crate::runtime::scheduler::{self, Handle as SchedulerHandle};

struct Fleet {
    schedulers: Vec<SchedulerHandle>,
    /// `Mutex`-guarded purely so `shutdown()` can `drain` it through a
    /// `&'static Fleet` — it's otherwise only ever touched once, from
    /// `shutdown()` itself.
    joins: Mutex<Vec<ThreadJoinHandle<()>>>,
    next: AtomicUsize,
}

impl Fleet {
    fn start(cfg: Config) -> Fleet {
        let mut schedulers = Vec::with_capacity(cfg.sched_num);
        let mut joins = Vec::with_capacity(cfg.sched_num);
        for _ in 0..cfg.sched_num {
            let (handle, join) = scheduler::spawn(cfg.clone());
            schedulers.push(handle);
            joins.push(join);
        }
        Fleet {
            schedulers,
            joins: Mutex::new(joins),
            next: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> &SchedulerHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.schedulers.len();
        &self.schedulers[i]
    }
}

static FLEET: OnceLock<Fleet> = OnceLock::new();

fn fleet() -> &'static Fleet {
    FLEET.get_or_init(|| Fleet::start(Config::from_env()))
}

/// Spawn a coroutine, placing it on the scheduler it is spawned from if one
/// is running on the current thread (keeping a chain of `go()` calls local
/// by default), or round-robining across the fleet otherwise. Returns a
/// [`JoinHandle`] the caller can suspend on to collect `f`'s result.
///
/// This is the `go()` operation from spec.md §1: the crate's main entry
/// point for scheduling work.
pub fn go<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_opts(Options::default(), f)
}

/// Like [`go`], with explicit spawn options (name, stack size).
pub fn spawn_opts<F, T>(opts: Options, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let target = scheduler::current_handle().unwrap_or_else(|| fleet().pick().clone());
    spawn_on(target, opts, f)
}

/// Like [`spawn_opts`], but pinned to a specific scheduler rather than
/// picked by affinity/round-robin. Used by `go`/`spawn_opts` themselves and
/// by `Scheduler::run`, which needs its coroutine placed on one particular
/// (the "main") scheduler rather than wherever the fleet would otherwise
/// send it.
///
/// Never allocates a stack and never blocks, per spec.md §4.6: the
/// coroutine is built stack-less and handed straight to `target`'s inbound
/// queue, exactly like every other `dispatch`. `target`'s own thread binds
/// a stack out of its own arena the first time it actually resumes this
/// coroutine (`runtime::scheduler::resume_one`) — true whether `target` is
/// the calling thread's own scheduler or a foreign one, so there is no
/// "local vs. remote" branch left to take here.
pub(crate) fn spawn_on<F, T>(target: SchedulerHandle, opts: Options, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (handle, shared) = join::new_pair::<T>();
    let body_shared = shared.clone();
    let body: coroutine::Entry = Box::new(move || {
        let value = f();
        join::report_value(&body_shared, value);
    });

    let weak = target.downgrade();
    let mut co = Coroutine::spawn(body, opts.stack_size, weak, opts.name);
    co.set_on_finish(move |panic| {
        if let Some(payload) = panic {
            join::report_panic(&shared, payload);
        }
        join::signal_done(&shared);
    });
    target.dispatch(co);
    handle
}

/// Number of schedulers currently in the fleet.
pub fn scheduler_count() -> usize {
    fleet().schedulers.len()
}

/// All schedulers currently in the fleet, in construction order. Backs
/// `coflow::all_schedulers()`.
pub fn all_schedulers() -> &'static [SchedulerHandle] {
    &fleet().schedulers
}

/// The fleet's first scheduler, by construction order. Backs
/// `coflow::main_scheduler()`.
pub fn first_scheduler() -> SchedulerHandle {
    fleet().schedulers[0].clone()
}

/// Run `f` as a coroutine pinned to this scheduler and block the calling OS
/// thread until it finishes, returning its value. Meant to be called from
/// `main`, never from inside a coroutine — use `go(f).join()` there, which
/// suspends instead of stalling the scheduler thread the call would
/// otherwise block.
///
/// A panicking `f` aborts the process, matching `error::abort_process`'s
/// "the runtime never unwinds a panic across a coroutine boundary" rule:
/// there is no caller-side `Result` to hand a `TaskFailed` to at this, the
/// outermost entry point.
impl SchedulerHandle {
    pub fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        spawn_on(self.clone(), Options::default(), f)
            .join_blocking()
            .unwrap_or_else(|e| crate::error::abort_process("main scheduler task failed", &e))
    }
}

/// Ask every scheduler to stop once its queues drain, and join their
/// threads. Intended for tests and embedders that need a clean process
/// exit; a long-running service normally just lets the fleet run until
/// `main` returns.
///
/// Not exposed as automatic `Drop` behavior on `Fleet` itself, since the
/// fleet is a process-wide singleton with `'static` lifetime by
/// construction (see `FLEET` above) — there's nothing to run its
/// destructor.
pub fn shutdown() {
    // `OnceLock` has no "take" short of nightly APIs; a fleet that was
    // never started has nothing to shut down.
    if let Some(f) = FLEET.get() {
        for s in &f.schedulers {
            s.request_stop();
        }
        for j in f.joins.lock().unwrap().drain(..) {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn go_runs_on_some_scheduler() {
        let (tx, rx) = channel();
        go(move || {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    }

    #[test]
    fn nested_go_defaults_to_the_spawning_scheduler() {
        let (tx, rx) = channel();
        go(move || {
            let here = coroutine::current().and_then(|c| c.scheduler().upgrade()).map(|h| h.id());
            let tx2 = tx.clone();
            go(move || {
                let there = coroutine::current().and_then(|c| c.scheduler().upgrade()).map(|h| h.id());
                tx2.send(here == there).unwrap();
            });
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
}
