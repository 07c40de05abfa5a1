// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements machine power management.
//!
//! A halted machine stops scheduling new work: the halting
//! thread terminates immediately and the test driver observes
//! the halt through [`halted`].

use crate::multitasking::thread;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};

static HALTED: AtomicBool = AtomicBool::new(false);

pub(crate) fn init() {
    HALTED.store(false, Ordering::Relaxed);
}

/// Returns whether the machine has been halted.
///
pub fn halted() -> bool {
    HALTED.load(Ordering::Relaxed)
}

/// Halts the machine.
///
/// The calling thread terminates without any further cleanup,
/// just as a powered-off machine performs none.
///
pub fn shutdown() -> ! {
    info!("Machine halted.");
    HALTED.store(true, Ordering::Relaxed);
    thread::terminate_current();
}
