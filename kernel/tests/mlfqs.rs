// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Scenario tests for the multi-level feedback queue
//! scheduler.

mod common;

use kernel::sync::Semaphore;
use kernel::{interrupts, scheduler, thread, BootOptions};
use std::sync::{Arc, Mutex};

fn mlfqs_options() -> BootOptions {
    BootOptions {
        mlfqs: true,
        ..BootOptions::default()
    }
}

#[test]
fn cpu_bound_threads_share_fairly() {
    let _machine = common::boot_with(mlfqs_options());

    // Ten CPU-bound threads with nice 0 run for 60 seconds of
    // ticks. Each must receive ticks within 10% of the mean.
    const WORKERS: usize = 10;
    const TOTAL_TICKS: i64 = 60 * time::TICKS_PER_SECOND;

    let counts: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(vec![0; WORKERS]));
    let done = Arc::new(Semaphore::new(0));

    for i in 0..WORKERS {
        let counts = counts.clone();
        let done = done.clone();
        thread::create("worker", thread::PRI_DEFAULT, move || {
            let mut mine = 0i64;
            while time::ticks() < TOTAL_TICKS {
                interrupts::timer_interrupt();
                mine += 1;
            }

            counts.lock().unwrap()[i] = mine;
            done.up();
        })
        .expect("failed to create worker");
    }

    for _ in 0..WORKERS {
        done.down();
    }

    let counts = counts.lock().unwrap().clone();
    let total: i64 = counts.iter().sum();
    let mean = total / WORKERS as i64;
    for (i, count) in counts.iter().enumerate() {
        let deviation = (count - mean).abs();
        assert!(
            deviation * 10 <= mean,
            "worker {} got {} ticks, more than 10% from the mean {}",
            i,
            count,
            mean
        );
    }

    // Sixty seconds of ten runnable threads pushes the load
    // average well above zero.
    assert!(scheduler::get_load_avg() > 500, "load_avg = {}", scheduler::get_load_avg());
}

#[test]
fn priority_follows_recent_cpu_and_nice() {
    let _machine = common::boot_with(mlfqs_options());

    // A fresh thread with nice 0 sits at PRI_MAX; burning CPU
    // pulls its priority down.
    assert_eq!(scheduler::get_priority(), thread::PRI_MAX);
    assert_eq!(scheduler::get_recent_cpu(), 0);

    for _ in 0..40 {
        interrupts::timer_interrupt();
    }

    assert!(scheduler::get_recent_cpu() > 0);
    let burned = scheduler::get_priority();
    assert!(burned < thread::PRI_MAX, "priority = {}", burned);

    // Raising nice costs two priority levels per step.
    let before = scheduler::get_priority();
    scheduler::set_nice(10);
    assert_eq!(scheduler::get_nice(), 10);
    assert_eq!(scheduler::get_priority(), (before - 20).max(thread::PRI_MIN));
}

#[test]
fn nice_is_inherited() {
    let _machine = common::boot_with(mlfqs_options());

    scheduler::set_nice(5);

    let observed: Arc<Mutex<i32>> = Arc::new(Mutex::new(0));
    let done = Arc::new(Semaphore::new(0));
    let child_nice = observed.clone();
    let signal = done.clone();
    thread::create("child", thread::PRI_DEFAULT, move || {
        *child_nice.lock().unwrap() = scheduler::get_nice();
        signal.up();
    })
    .expect("failed to create child");

    done.down();
    assert_eq!(*observed.lock().unwrap(), 5);
}

#[test]
fn set_priority_is_inert_under_mlfqs() {
    let _machine = common::boot_with(mlfqs_options());

    let before = scheduler::get_priority();
    scheduler::set_priority(thread::PRI_MIN);
    assert_eq!(scheduler::get_priority(), before);
}
