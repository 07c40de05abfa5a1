// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Runs user programs.
//!
//! This machine has no instruction emulator, so "user mode" is
//! a registry of program bodies keyed by executable name: when
//! a process finishes loading, the kernel looks up the body
//! registered for its executable and runs it with a
//! [`UserContext`]. The context only allows what real user
//! code could do — touch user memory through the MMU and issue
//! system calls through the syscall ABI — so every kernel path
//! a real program would exercise is exercised here, including
//! demand paging on ordinary loads and stores.
//!
//! A program body returns its exit status, and the context
//! issues the final exit syscall, the way a C runtime calls
//! `exit(main(...))`. An executable with no registered body
//! exits immediately with status 0.

use crate::multitasking::thread;
use crate::syscall::{self, IntrFrame};
use crate::vm::usermem;
use lazy_static::lazy_static;
use memlayout::VirtAddr;
use spin::{lock, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;

type ProgramBody = dyn Fn(&mut UserContext) -> i32 + Send + Sync;

lazy_static! {
    static ref PROGRAMS: Mutex<BTreeMap<String, Arc<ProgramBody>>> = Mutex::new(BTreeMap::new());
}

pub(crate) fn init() {
    lock!(PROGRAMS).clear();
}

/// Registers the body run by processes whose executable has
/// the given name, replacing any previous body.
///
pub fn register_user_program<F>(name: &str, body: F)
where
    F: Fn(&mut UserContext) -> i32 + Send + Sync + 'static,
{
    lock!(PROGRAMS).insert(String::from(name), Arc::new(body));
}

// Enters user mode in the current process: runs the
// registered program body and exits with its return value.
//
pub(super) fn enter(entry: VirtAddr, esp: VirtAddr) -> ! {
    let body = lock!(PROGRAMS).get(&thread::name()).cloned();
    let mut context = UserContext { entry, esp };
    let status = match body {
        Some(body) => (*body)(&mut context),
        None => 0,
    };

    context.syscall(syscall::SYS_EXIT, &[status as u32]);
    unreachable!("exit syscall returned");
}

/// The machine state a user program runs with: its entry
/// point and stack pointer. All memory access goes through
/// the MMU and faults like real loads and stores; invalid
/// accesses terminate the process with status -1.
///
pub struct UserContext {
    entry: VirtAddr,
    esp: VirtAddr,
}

impl UserContext {
    /// Returns the program's entry point.
    ///
    pub fn entry(&self) -> VirtAddr {
        self.entry
    }

    /// Returns the current user stack pointer.
    ///
    pub fn esp(&self) -> VirtAddr {
        self.esp
    }

    /// Issues a system call: the number and arguments are
    /// pushed onto the user stack and the syscall interrupt
    /// is raised. Returns the value the kernel left in eax.
    ///
    pub fn syscall(&mut self, number: u32, args: &[u32]) -> i32 {
        let sp = self.esp - 4 * (args.len() + 1);
        self.store_u32(sp, number);
        for (i, arg) in args.iter().enumerate() {
            self.store_u32(sp + 4 * (i + 1), *arg);
        }

        let mut frame = IntrFrame { esp: sp, eax: 0 };
        syscall::handler(&mut frame);

        frame.eax as i32
    }

    /// Loads bytes from user memory, faulting pages in on
    /// demand. An invalid address kills the process.
    ///
    pub fn load(&self, addr: VirtAddr, len: usize) -> Vec<u8> {
        match usermem::read_bytes(addr, len) {
            Ok(bytes) => bytes,
            Err(_) => kill(),
        }
    }

    /// Loads a little-endian word from user memory.
    ///
    pub fn load_u32(&self, addr: VirtAddr) -> u32 {
        match usermem::read_u32(addr) {
            Ok(word) => word,
            Err(_) => kill(),
        }
    }

    /// Stores bytes to user memory, faulting pages in on
    /// demand. An invalid address or a read-only page kills
    /// the process.
    ///
    pub fn store(&self, addr: VirtAddr, bytes: &[u8]) {
        if usermem::write_bytes(addr, bytes).is_err() {
            kill();
        }
    }

    /// Stores a little-endian word to user memory.
    ///
    pub fn store_u32(&self, addr: VirtAddr, word: u32) {
        if usermem::write_u32(addr, word).is_err() {
            kill();
        }
    }
}

// An unhandled user fault: the process dies with status -1,
// which it carries unless it already called exit.
//
fn kill() -> ! {
    thread::exit();
}
