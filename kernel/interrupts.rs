// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the machine's virtual interrupt line.
//!
//! The machine has a single CPU, so atomicity between a thread
//! and an interrupt handler is achieved by disabling interrupts,
//! not by taking locks. This module tracks the interrupt flag,
//! whether the CPU is currently inside an interrupt handler, and
//! whether the handler has asked the interrupted thread to yield
//! on return.
//!
//! The external timer source delivers ticks through
//! [`timer_interrupt`], which runs the tick handler in interrupt
//! context on the current thread, exactly as a hardware timer
//! interrupt would.

use crate::multitasking::scheduler;
use core::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(false);
static IN_HANDLER: AtomicBool = AtomicBool::new(false);
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

/// Resets the interrupt state, with interrupts disabled, as at
/// boot.
///
pub(crate) fn init() {
    ENABLED.store(false, Ordering::Relaxed);
    IN_HANDLER.store(false, Ordering::Relaxed);
    YIELD_ON_RETURN.store(false, Ordering::Relaxed);
}

/// Returns whether interrupts are enabled.
///
pub fn are_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Enables interrupts.
///
/// # Panics
///
/// `enable` panics if called from interrupt context, as a
/// handler must not allow nested interrupts.
///
pub fn enable() {
    assert!(!in_interrupt(), "interrupts enabled inside an interrupt handler");
    ENABLED.store(true, Ordering::Relaxed);
}

/// Disables interrupts, returning whether they were enabled
/// beforehand.
///
pub fn disable() -> bool {
    ENABLED.swap(false, Ordering::Relaxed)
}

/// Restores the interrupt state returned by [`disable`].
///
pub fn set_level(enabled: bool) {
    if enabled {
        enable();
    } else {
        ENABLED.store(false, Ordering::Relaxed);
    }
}

/// Calls `f` with interrupts disabled, then restores the
/// previous interrupt state.
///
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let enabled = disable();
    let result = f();
    set_level(enabled);

    result
}

/// Returns whether the CPU is currently running an interrupt
/// handler.
///
pub fn in_interrupt() -> bool {
    IN_HANDLER.load(Ordering::Relaxed)
}

/// Asks the scheduler to switch threads once the current
/// interrupt handler returns.
///
/// This is how an interrupt handler preempts the running
/// thread without blocking inside the handler.
///
pub(crate) fn yield_on_return() {
    debug_assert!(in_interrupt());
    YIELD_ON_RETURN.store(true, Ordering::Relaxed);
}

/// Delivers a timer tick to the kernel.
///
/// The caller stands in for the hardware timer: the handler
/// runs in interrupt context on the current thread, and any
/// yield the handler requests is taken as the "interrupt"
/// returns.
///
/// # Panics
///
/// `timer_interrupt` panics if interrupts are disabled or the
/// CPU is already inside a handler; hardware would hold the
/// tick back in both cases.
///
pub fn timer_interrupt() {
    assert!(are_enabled(), "timer tick delivered with interrupts disabled");
    assert!(!in_interrupt(), "timer tick delivered inside an interrupt handler");

    ENABLED.store(false, Ordering::Relaxed);
    IN_HANDLER.store(true, Ordering::Relaxed);

    time::tick();
    scheduler::tick();

    IN_HANDLER.store(false, Ordering::Relaxed);
    ENABLED.store(true, Ordering::Relaxed);

    if YIELD_ON_RETURN.swap(false, Ordering::Relaxed) {
        scheduler::yield_now();
    }
}
