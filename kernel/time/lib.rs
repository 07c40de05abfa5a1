// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tracks the kernel's monotonic tick counter and time slices.
//!
//! A tick is the smallest unit of scheduler time. The external
//! timer source drives the counter through [`tick`]; everything
//! that reasons about time — the sleep queue, the time slice
//! accounting, the MLFQ decay — reads it through [`ticks`].

#![no_std]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

mod slice;

pub use slice::TimeSlice;

use core::sync::atomic::{AtomicI64, Ordering};

/// The number of times the system ticker is incremented per
/// second.
///
pub const TICKS_PER_SECOND: i64 = 100;

// The system ticker, which is a monotonic counter.
//
static TICKER: AtomicI64 = AtomicI64::new(0);

/// Resets the system ticker to zero.
///
/// Called when the kernel boots (or reboots, in tests).
///
pub fn init() {
    TICKER.store(0, Ordering::Relaxed);
}

/// Increments the system ticker.
///
pub fn tick() {
    TICKER.fetch_add(1, Ordering::Relaxed);
}

/// Returns the number of ticks since the kernel booted.
///
pub fn ticks() -> i64 {
    TICKER.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker() {
        init();
        assert_eq!(ticks(), 0);
        tick();
        tick();
        assert_eq!(ticks(), 2);
        init();
        assert_eq!(ticks(), 0);
    }
}
