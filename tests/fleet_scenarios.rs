// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! End-to-end scenarios exercising the fleet as a whole: several schedulers,
//! several coroutines, a shared primitive. One test per scenario; each runs
//! against `coflow::main_scheduler()`, the crate's single process-wide
//! fleet, so they all share it the way independent `go()` callers in a
//! real program would.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coflow::sync::{channel, Event, WaitGroup};

/// 8 coroutines each increment a shared counter 100 times, yielding between
/// increments; the final total is exact regardless of how the fleet
/// interleaves them.
#[test]
fn e1_concurrent_counters_land_on_the_exact_total() {
    coflow::main_scheduler().run(|| {
        let counter = Arc::new(AtomicI64::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                coflow::go(move || {
                    for _ in 0..100 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        coflow::yield_now();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 800);
    });
}

/// A wait-group of 8 workers, each sleeping ~32ms before calling `done()`;
/// `wait()` should return once all 8 have, and not meaningfully before.
#[test]
fn e2_wait_group_unblocks_once_every_worker_is_done() {
    coflow::main_scheduler().run(|| {
        let wg = Arc::new(WaitGroup::new());
        wg.add(8);

        for _ in 0..8 {
            let wg = wg.clone();
            coflow::go(move || {
                coflow::sleep(Duration::from_millis(32)).unwrap();
                wg.done();
            });
        }

        let start = Instant::now();
        wg.wait();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(28), "returned too early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(250), "returned too late: {:?}", elapsed);
    });
}

/// A bounded channel (capacity 32) carries 1..=1000 from one producer to
/// one consumer; values arrive in order, none dropped or duplicated.
#[test]
fn e3_bounded_channel_preserves_order_under_backpressure() {
    coflow::main_scheduler().run(|| {
        let (tx, rx) = channel::<u32>(32);

        coflow::go(move || {
            for i in 1..=1000u32 {
                tx.send(i).unwrap();
            }
            tx.close();
        });

        let received = coflow::go(move || {
            let mut values = Vec::with_capacity(1000);
            loop {
                match rx.recv() {
                    Ok(v) => values.push(v),
                    Err(_) => break,
                }
            }
            values
        })
        .join()
        .unwrap();

        let expected: Vec<u32> = (1..=1000).collect();
        assert_eq!(received, expected);
    });
}

/// One coroutine waits on an `Event` indefinitely; another signals it after
/// ~100ms from a different scheduler. The waiter wakes with a true result
/// at roughly the signal time, not immediately and not never.
#[test]
fn e4_event_wakes_the_waiter_when_signaled() {
    coflow::main_scheduler().run(|| {
        let event = Arc::new(Event::new());
        let waiter_event = event.clone();

        let waiter = coflow::go(move || {
            let start = Instant::now();
            waiter_event.wait();
            start.elapsed()
        });

        let signaler_event = event.clone();
        coflow::go(move || {
            coflow::sleep(Duration::from_millis(100)).unwrap();
            signaler_event.signal();
        });

        let elapsed = waiter.join().unwrap();
        assert!(elapsed >= Duration::from_millis(80), "woke too early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(400), "woke too late: {:?}", elapsed);
    });
}

/// A TCP echo server handles 100 concurrent clients, each sending "ping"
/// and expecting "pong" back, spread across the whole fleet rather than
/// pinned to the main scheduler.
#[test]
fn e5_tcp_echo_server_handles_concurrent_clients() {
    use coflow::net::{TcpListener, TcpStream};
    use std::io::{Read, Write};

    coflow::main_scheduler().run(|| {
        let bind_addr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&bind_addr).unwrap();
        let addr = listener.local_addr().unwrap();

        coflow::go(move || loop {
            let stream = match listener.accept() {
                Ok((s, _)) => s,
                Err(_) => break,
            };
            coflow::go(move || {
                let mut stream = stream;
                let mut buf = [0u8; 4];
                if stream.read_exact(&mut buf).is_ok() {
                    let _ = stream.write_all(b"pong");
                }
            });
        });

        let clients: Vec<_> = (0..100)
            .map(|_| {
                coflow::go(move || {
                    let mut stream = TcpStream::connect(&addr, None).unwrap();
                    stream.write_all(b"ping").unwrap();
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).unwrap();
                    &buf == b"pong"
                })
            })
            .collect();

        for client in clients {
            assert!(client.join().unwrap(), "client did not receive pong");
        }
    });
}

// E6 (spec.md §8) exercises a standalone monotonic-clock primitive
// (`now::us()`) that has no counterpart among this crate's external
// interfaces (§6 lists none) — the runtime's own timers are built directly
// on `std::time::Instant`, whose monotonicity is a standard-library
// guarantee rather than something this crate implements or needs to
// re-verify.
