// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements preemptive multitasking, using independent threads of execution.
//!
//! This module owns the global thread table and the scheduler
//! state. Threads can be created, block, sleep, be resumed and
//! exit; the scheduler preempts them when their time slice runs
//! out or a higher-priority thread becomes runnable.
//!
//! The global lists live behind [`thread::init`], so tests can
//! tear the kernel down and boot it again.

pub mod scheduler;
pub mod sync;
pub mod thread;

mod switch;

use lazy_static::lazy_static;
use self::thread::{Thread, Tid};
use spin::{lock, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;

lazy_static! {
    /// All live threads, keyed by thread id.
    ///
    /// A thread is inserted when it is created and removed when
    /// it exits; the final reference to an exited thread is
    /// dropped by the next thread to run, never by the exiting
    /// thread itself.
    ///
    static ref THREADS: Mutex<BTreeMap<Tid, Arc<Thread>>> = Mutex::new(BTreeMap::new());

    /// The currently executing thread.
    ///
    static ref CURRENT: Mutex<Option<Arc<Thread>>> = Mutex::new(None);

    /// The idle thread, to which we fall back if no other
    /// thread is runnable.
    ///
    static ref IDLE: Mutex<Option<Arc<Thread>>> = Mutex::new(None);

    /// The initial thread: the caller of [`thread::init`],
    /// turned into a thread.
    ///
    static ref INITIAL: Mutex<Option<Tid>> = Mutex::new(None);
}

// Returns the currently executing thread without checking its
// state. Most callers want thread::current, which also checks
// the stack sentinel and the running status.
//
pub(crate) fn running_thread() -> Arc<Thread> {
    lock!(CURRENT).clone().expect("no current thread: thread::init not called")
}

// Returns whether the given thread is this machine's idle
// thread.
//
pub(crate) fn is_idle(thread: &Arc<Thread>) -> bool {
    match &*lock!(IDLE) {
        Some(idle) => Arc::ptr_eq(idle, thread),
        None => false,
    }
}
