// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the machine's console.
//!
//! User processes reach the console through file descriptors 0
//! and 1: reads pull one byte at a time from the input queue,
//! writes append to the output. On this machine the output is
//! captured in a buffer the test driver can drain, and the
//! input queue is fed by the driver in place of a keyboard.

use lazy_static::lazy_static;
use spin::{lock, Mutex};
use std::collections::VecDeque;

lazy_static! {
    static ref OUTPUT: Mutex<String> = Mutex::new(String::new());
    static ref INPUT: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());
}

/// Clears the console buffers, as at boot.
///
pub(crate) fn init() {
    lock!(OUTPUT).clear();
    lock!(INPUT).clear();
}

/// Writes a buffer of bytes to the console.
///
pub fn putbuf(buf: &[u8]) {
    lock!(OUTPUT).push_str(&String::from_utf8_lossy(buf));
}

/// Writes formatted text to the console.
///
pub fn print(args: std::fmt::Arguments) {
    use std::fmt::Write;
    lock!(OUTPUT).write_fmt(args).expect("console write failed");
}

/// Reads one byte from the console input queue, or zero if no
/// input is pending.
///
pub fn input_getc() -> u8 {
    lock!(INPUT).pop_front().unwrap_or(0)
}

/// Queues bytes on the console input, as if typed.
///
pub fn feed_input(bytes: &[u8]) {
    lock!(INPUT).extend(bytes.iter().copied());
}

/// Drains and returns everything written to the console so
/// far.
///
pub fn take_output() -> String {
    std::mem::take(&mut *lock!(OUTPUT))
}

/// Returns a copy of everything written to the console since
/// boot (or the last drain).
///
pub fn output() -> String {
    lock!(OUTPUT).clone()
}
