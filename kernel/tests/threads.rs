// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Scenario tests for the thread kernel: timer sleep, priority
//! scheduling, donation and the synchronisation primitives.

mod common;

use kernel::sync::{Lock, Semaphore};
use kernel::{interrupts, scheduler, thread};
use std::sync::{Arc, Mutex};

#[test]
fn alarm_wakes_in_order() {
    let _machine = common::boot();

    // Three threads sleep for 30, 10 and 20 ticks. They must
    // wake in the order 10, 20, 30, at those ticks.
    let log: Arc<Mutex<Vec<(&'static str, i64)>>> = Arc::new(Mutex::new(Vec::new()));

    for (name, ticks) in [("sleep30", 30i64), ("sleep10", 10), ("sleep20", 20)] {
        let log = log.clone();
        thread::create(name, 32, move || {
            thread::sleep(ticks);
            log.lock().unwrap().push((name, time::ticks()));
        })
        .expect("failed to create sleeper");
    }

    for _ in 0..40 {
        interrupts::timer_interrupt();
    }

    let woken = log.lock().unwrap().clone();
    assert_eq!(woken, vec![("sleep10", 10), ("sleep20", 20), ("sleep30", 30)]);
}

#[test]
fn priority_donation_chain() {
    let _machine = common::boot();

    // Thread L (31) holds lock A; M (33) holds B and blocks
    // on A; H (35) blocks on B. The donation must flow down
    // the chain so L runs at 35, and the threads must finish
    // in the order L, M, H.
    scheduler::set_priority(0);

    let a = Lock::new();
    let b = Lock::new();
    let gate = Arc::new(Semaphore::new(0));
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let low = {
        let a = a.clone();
        let gate = gate.clone();
        let log = log.clone();
        thread::create("low", 31, move || {
            a.acquire();
            gate.down();
            log.lock().unwrap().push("L");
            a.release();
        })
        .expect("failed to create low")
    };

    let medium = {
        let a = a.clone();
        let b = b.clone();
        let log = log.clone();
        thread::create("medium", 33, move || {
            b.acquire();
            a.acquire();
            log.lock().unwrap().push("M");
            a.release();
            b.release();
        })
        .expect("failed to create medium")
    };

    let high = {
        let b = b.clone();
        let log = log.clone();
        thread::create("high", 35, move || {
            b.acquire();
            log.lock().unwrap().push("H");
            b.release();
        })
        .expect("failed to create high")
    };

    // With the whole chain blocked, the donations have
    // cascaded down to L.
    assert_eq!(thread::effective_priority_of(low), Some(35));
    assert_eq!(thread::effective_priority_of(medium), Some(35));
    assert_eq!(thread::effective_priority_of(high), Some(35));

    // Release L and let the chain unwind.
    gate.up();

    assert_eq!(*log.lock().unwrap(), vec!["L", "M", "H"]);
    assert_eq!(thread::effective_priority_of(low), None);
}

#[test]
fn set_priority_round_trip() {
    let _machine = common::boot();

    assert_eq!(scheduler::get_priority(), thread::PRI_DEFAULT);

    scheduler::set_priority(45);
    assert_eq!(scheduler::get_priority(), 45);

    scheduler::set_priority(thread::PRI_MIN);
    assert_eq!(scheduler::get_priority(), thread::PRI_MIN);

    scheduler::set_priority(thread::PRI_DEFAULT);
}

#[test]
fn donation_masks_base_priority() {
    let _machine = common::boot();
    scheduler::set_priority(10);

    // A higher-priority waiter raises the holder's effective
    // priority but never its base priority.
    let lock = Lock::new();
    lock.acquire();

    let contender = {
        let lock = lock.clone();
        thread::create("contender", 40, move || {
            lock.acquire();
            lock.release();
        })
        .expect("failed to create contender")
    };

    assert_eq!(scheduler::get_priority(), 40);

    lock.release();
    assert_eq!(scheduler::get_priority(), 10);
    assert_eq!(thread::effective_priority_of(contender), None);

    scheduler::set_priority(thread::PRI_DEFAULT);
}

#[test]
fn semaphore_wakes_highest_priority_first() {
    let _machine = common::boot();

    let sema = Arc::new(Semaphore::new(0));
    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    for priority in [32, 36, 34] {
        let sema = sema.clone();
        let log = log.clone();
        thread::create("waiter", priority, move || {
            sema.down();
            log.lock().unwrap().push(priority);
        })
        .expect("failed to create waiter");
    }

    sema.up();
    sema.up();
    sema.up();

    assert_eq!(*log.lock().unwrap(), vec![36, 34, 32]);
}

#[test]
fn round_robin_time_slices() {
    let _machine = common::boot();

    // Two equal-priority CPU hogs must alternate every
    // TIME_SLICE ticks.
    scheduler::set_priority(40);

    let log: Arc<Mutex<Vec<(&'static str, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Semaphore::new(0));

    for name in ["hog-a", "hog-b"] {
        let log = log.clone();
        let done = done.clone();
        thread::create(name, 32, move || {
            while time::ticks() < 16 {
                log.lock().unwrap().push((name, time::ticks()));
                interrupts::timer_interrupt();
            }

            done.up();
        })
        .expect("failed to create hog");
    }

    done.down();
    done.down();

    let slices: Vec<(&str, i64)> = log.lock().unwrap().clone();
    let expected: Vec<(&str, i64)> = (0..16)
        .map(|tick| {
            let name = if (tick / scheduler::TIME_SLICE) % 2 == 0 { "hog-a" } else { "hog-b" };
            (name, tick)
        })
        .collect();
    assert_eq!(slices, expected);

    let (_, kernel_ticks, _) = scheduler::stats();
    assert!(kernel_ticks >= 16);
}

#[test]
fn condvar_signal_and_broadcast() {
    let _machine = common::boot();

    let monitor = Lock::new();
    let condvar = kernel::sync::Condvar::new();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second", "third"] {
        let monitor = monitor.clone();
        let condvar = condvar.clone();
        let log = log.clone();
        thread::create(name, 32, move || {
            monitor.acquire();
            condvar.wait(&monitor);
            log.lock().unwrap().push(name);
            monitor.release();
        })
        .expect("failed to create waiter");
    }

    // Signal wakes exactly one thread, in arrival order;
    // broadcast wakes the rest.
    monitor.acquire();
    condvar.signal(&monitor);
    monitor.release();
    thread::yield_now();
    assert_eq!(*log.lock().unwrap(), vec!["first"]);

    monitor.acquire();
    condvar.broadcast(&monitor);
    monitor.release();
    thread::yield_now();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}
