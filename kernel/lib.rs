// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! kernel implements the Petrel kernel core.
//!
//! Petrel is a small educational kernel: a preemptive priority
//! scheduler with donation and an MLFQ mode, user processes
//! loaded from ELF executables, and demand-paged virtual
//! memory with eviction to swap. The core runs hosted: the
//! hardware surfaces it consumes — the timer line, the MMU,
//! the frame pool, the swap device, the console and the
//! filesystem — are small in-crate collaborators, so the whole
//! kernel is deterministic and drivable from tests.
//!
//! [`boot`] brings the machine up and turns the caller into
//! the initial thread. The kernel can be booted again to model
//! a fresh machine; threads left over from an earlier boot
//! stay parked forever, like a machine that was powered off.
//!
//! # Kernel subsystems
//!
//! Several parts of kernel functionality are provided in
//! separate crates. These are:
//!
//! - [filesystem](::filesystem)
//! - [memory/memlayout](::memlayout)
//! - [memory/physmem](::physmem)
//! - [time](::time)
//! - [utils/bitmap_index](::bitmap_index)
//! - [utils/fixedpoint](::fixedpoint)
//! - [utils/spin](::spin)

#![deny(clippy::wildcard_imports)]

pub mod console;
pub mod interrupts;
pub mod multitasking;
pub mod power;
pub mod process;
pub mod syscall;
pub mod vm;

mod fs;

pub use fs::{end_file_system_access, start_file_system_access, with_file_system};
pub use multitasking::{scheduler, sync, thread};

/// Configures the machine being booted.
///
#[derive(Clone, Debug)]
pub struct BootOptions {
    /// Use the multi-level feedback queue scheduler instead
    /// of strict priority scheduling.
    pub mlfqs: bool,

    /// The number of frames in the user page pool.
    pub user_frames: usize,

    /// The number of page-sized slots on the swap device.
    pub swap_slots: usize,
}

impl Default for BootOptions {
    fn default() -> Self {
        BootOptions {
            mlfqs: false,
            user_frames: 64,
            swap_slots: 128,
        }
    }
}

impl BootOptions {
    /// Parses a kernel command line. The token `-o mlfqs`
    /// selects the MLFQ scheduler; everything else keeps its
    /// default.
    ///
    pub fn from_command_line(cmdline: &str) -> Self {
        let mut options = BootOptions::default();
        let mut tokens = cmdline.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "-o" && tokens.next() == Some("mlfqs") {
                options.mlfqs = true;
            }
        }

        options
    }
}

/// Boots the machine: resets every subsystem and transforms
/// the caller into the initial thread, with preemptive
/// scheduling running.
///
/// After `boot` returns the caller is the thread named "main"
/// and interrupts are enabled.
///
pub fn boot(options: BootOptions) {
    console::init();
    power::init();
    filesystem::init();
    fs::init();
    time::init();
    physmem::init(options.user_frames);
    vm::init(options.swap_slots);
    process::usermode::init();

    thread::init(options.mlfqs);
    thread::start();
}

#[cfg(test)]
mod tests {
    use super::BootOptions;

    #[test]
    fn command_line() {
        assert!(!BootOptions::from_command_line("").mlfqs);
        assert!(!BootOptions::from_command_line("run alarm-multiple").mlfqs);
        assert!(BootOptions::from_command_line("-o mlfqs run mlfqs-load-1").mlfqs);

        // The option is case-sensitive and must follow -o.
        assert!(!BootOptions::from_command_line("-o MLFQS").mlfqs);
        assert!(!BootOptions::from_command_line("mlfqs").mlfqs);
    }
}
