// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the context switch between threads.
//!
//! Each kernel thread is backed by a host thread that is parked
//! on the thread's *baton* whenever the thread is not on the
//! CPU. A switch hands the baton to the next thread and parks
//! the outgoing one; since exactly one baton is lit at a time,
//! exactly one thread executes kernel or user code at a time,
//! which is what makes interrupt-disabling a sound critical
//! section on this machine.
//!
//! An exiting thread hands the baton over and then unwinds its
//! host thread with a private panic payload; the *next* thread
//! to run drops the final reference to its control block, so a
//! thread never frees its own state while still executing on it.

use super::scheduler;
use super::thread::{Status, Thread};
use lazy_static::lazy_static;
use spin::{lock, Mutex};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex as HostMutex};

// The panic payload used to unwind an exiting thread's host
// thread. Not an error: this is the hosted equivalent of a
// stack that is never switched back to.
//
pub(super) struct ThreadExitToken;

lazy_static! {
    // The thread we most recently switched away from. Written
    // by the outgoing thread, taken by the incoming thread in
    // schedule_tail. A single cell suffices: only one handoff
    // is ever in flight.
    //
    static ref PREVIOUS: Mutex<Option<Arc<Thread>>> = Mutex::new(None);
}

/// The baton that marks which thread owns the CPU.
///
pub(super) struct Baton {
    running: HostMutex<bool>,
    handed: Condvar,
}

impl Baton {
    pub fn new() -> Self {
        Baton {
            running: HostMutex::new(false),
            handed: Condvar::new(),
        }
    }

    // Lights this thread's baton and wakes its host thread.
    //
    fn hand_over(&self) {
        let mut running = self.running.lock().expect("baton poisoned");
        *running = true;
        self.handed.notify_one();
    }

    // Parks the calling host thread until the baton is handed
    // to it, then takes the baton.
    //
    fn wait_for_cpu(&self) {
        let mut running = self.running.lock().expect("baton poisoned");
        while !*running {
            running = self.handed.wait(running).expect("baton poisoned");
        }

        *running = false;
    }
}

// Takes the thread we most recently switched away from.
//
pub(super) fn take_previous() -> Option<Arc<Thread>> {
    lock!(PREVIOUS).take()
}

// Switches from `current` to `next`. Interrupts must be
// disabled and the global current thread must already have
// been updated to `next`.
//
// For a live thread this returns when the thread is next
// scheduled, after its side of schedule_tail has run. For a
// dying thread this never returns: the host thread unwinds.
//
pub(super) fn switch_threads(current: Arc<Thread>, next: Arc<Thread>) {
    let dying = current.status() == Status::Dying;

    *lock!(PREVIOUS) = Some(current.clone());
    next.baton().hand_over();

    if dying {
        // From this point the CPU belongs to `next`; unwind
        // the host thread without touching shared state.
        drop(current);
        drop(next);
        std::panic::panic_any(ThreadExitToken);
    }

    current.baton().wait_for_cpu();
    scheduler::schedule_tail();
}

// The first frames of every spawned thread's host thread. Waits
// to be scheduled for the first time, completes the switch, and
// runs the thread's function with interrupts enabled. If the
// function returns without exiting, the thread exits on its
// behalf.
//
pub(super) fn thread_entry<F>(thread: Arc<Thread>, func: F)
where
    F: FnOnce() + Send + 'static,
{
    thread.baton().wait_for_cpu();
    drop(thread);
    scheduler::schedule_tail();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        crate::interrupts::enable();
        func();

        // The function returned normally, so exit the thread.
        // exit unwinds with a ThreadExitToken, which the outer
        // catch_unwind collects.
        super::thread::exit();
    }));

    if let Err(payload) = outcome {
        if !payload.is::<ThreadExitToken>() {
            // A panic in kernel code is a kernel panic: this
            // machine is broken, so take it down loudly rather
            // than hanging the remaining threads.
            eprintln!("kernel panic in thread: machine halted");
            resume_unwind(payload);
        }
    }
}
