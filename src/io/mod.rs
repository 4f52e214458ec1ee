// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The process-wide file descriptor table: tracks which scheduler currently
//! owns each direction (read/write) of a descriptor, for the debug-mode
//! single-owner assertion spec.md §9 Open Question (i) resolves in favor of.
//!
//! A real per-fd readiness *registration* lives on whichever scheduler's
//! `mio::EventLoop` actually polls it (`runtime::scheduler::register`) — this
//! table only answers "is anyone else already waiting on this fd in this
//! direction", which is process-wide by nature since two different
//! schedulers could otherwise both try to drive the same socket.
//!
//! spec.md describes a chunked 2-D array growing on demand, mirroring the
//! upstream C++ runtime's fixed-size-chunk fd table. A `HashMap` gives the
//! same "sparse, grows on demand, O(1) amortized" contract without the
//! manual chunk bookkeeping, which is why it's used here instead.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Default)]
struct FdState {
    reader: Option<usize>,
    writer: Option<usize>,
}

static TABLE: OnceLock<Mutex<HashMap<RawFd, FdState>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<RawFd, FdState>> {
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Claim `direction` of `fd` for the calling scheduler. In debug builds,
/// panics if another scheduler already owns that direction — the hook
/// layer and `net::` module are expected to never hand the same socket
/// direction to two schedulers concurrently (spec.md §5's single-owner
/// invariant); release builds just overwrite the owner, trusting the
/// caller.
pub fn claim(fd: RawFd, direction: Direction, owner: usize) {
    let mut table = table().lock().unwrap();
    let state = table.entry(fd).or_default();
    let slot = match direction {
        Direction::Read => &mut state.reader,
        Direction::Write => &mut state.writer,
    };
    debug_assert!(
        slot.is_none() || *slot == Some(owner),
        "fd {} {:?} direction already owned by a different scheduler",
        fd,
        direction
    );
    *slot = Some(owner);
}

/// Release `direction` of `fd`, e.g. once a coroutine's call on it completes
/// or the socket is closed.
pub fn release(fd: RawFd, direction: Direction) {
    let mut table = table().lock().unwrap();
    if let Some(state) = table.get_mut(&fd) {
        match direction {
            Direction::Read => state.reader = None,
            Direction::Write => state.writer = None,
        }
        if state.reader.is_none() && state.writer.is_none() {
            table.remove(&fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_release_round_trip() {
        claim(999, Direction::Read, 7);
        release(999, Direction::Read);
        // A second, different owner claiming after release must not panic.
        claim(999, Direction::Read, 8);
        release(999, Direction::Read);
    }

    #[test]
    #[should_panic(expected = "already owned")]
    fn debug_assert_catches_cross_scheduler_reuse() {
        claim(1000, Direction::Write, 1);
        claim(1000, Direction::Write, 2);
    }
}
