// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the system call interface.
//!
//! A user program raises interrupt 0x30 with the syscall
//! number at the top of its stack and the arguments in the
//! following words. The handler validates every word it reads
//! from user memory and every buffer a call names; any invalid
//! pointer terminates the process with exit status -1. Return
//! values are written to the frame's `eax`.
//!
//! Filesystem calls copy user data into kernel buffers before
//! taking the global filesystem lock, so a page fault can
//! never occur while the lock is held.

use crate::multitasking::thread::{self, Tid};
use crate::vm::usermem;
use crate::{console, fs, power, process};
use memlayout::{VirtAddr, PGSIZE};

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;

const NUM_SYSCALLS: u32 = 13;

/// The register state a syscall interrupt delivers to the
/// kernel: the user stack pointer locating the arguments, and
/// `eax` for the return value.
///
pub struct IntrFrame {
    pub esp: VirtAddr,
    pub eax: u32,
}

/// Handles a syscall interrupt.
///
/// # Panics
///
/// `handler` panics on an unknown syscall number. A user
/// program linked against a valid libc cannot produce one, so
/// this is a kernel bug, not user error.
///
pub fn handler(frame: &mut IntrFrame) {
    // The stack pointer itself may be garbage, so the number
    // read is validated like any other user pointer.
    let number = read_word(frame.esp);
    assert!(number < NUM_SYSCALLS, "unknown syscall number {}", number);

    match number {
        SYS_HALT => power::shutdown(),
        SYS_EXIT => sys_exit(arg(frame, 0) as i32),
        SYS_EXEC => frame.eax = sys_exec(frame) as u32,
        SYS_WAIT => frame.eax = process::wait(Tid::from_i32(arg(frame, 0) as i32)) as u32,
        SYS_CREATE => frame.eax = sys_create(frame) as u32,
        SYS_REMOVE => frame.eax = sys_remove(frame) as u32,
        SYS_OPEN => frame.eax = sys_open(frame) as u32,
        SYS_FILESIZE => frame.eax = sys_filesize(frame) as u32,
        SYS_READ => frame.eax = sys_read(frame) as u32,
        SYS_WRITE => frame.eax = sys_write(frame) as u32,
        SYS_SEEK => sys_seek(frame),
        SYS_TELL => frame.eax = sys_tell(frame),
        SYS_CLOSE => sys_close(frame),
        _ => unreachable!(),
    }
}

// Reads the i'th syscall argument from the user stack.
//
fn arg(frame: &IntrFrame, i: usize) -> u32 {
    read_word(frame.esp + 4 * (i + 1))
}

fn read_word(addr: VirtAddr) -> u32 {
    match usermem::read_u32(addr) {
        Ok(word) => word,
        Err(_) => kill(),
    }
}

// Reads the NUL-terminated path argument at the given user
// address. Paths longer than a page are invalid.
//
fn read_path(addr: u32) -> String {
    if addr == 0 {
        kill();
    }

    match usermem::read_cstr(VirtAddr::new(addr), PGSIZE) {
        Ok(path) => path,
        Err(_) => kill(),
    }
}

// Terminates the process over an invalid pointer. The exit
// status stays -1 unless the process already exited.
//
fn kill() -> ! {
    thread::exit();
}

fn sys_exit(status: i32) -> ! {
    let process = thread::current().process().expect("exit syscall from a kernel thread");
    process.set_exit_status(status);
    thread::exit();
}

fn sys_exec(frame: &IntrFrame) -> i32 {
    let cmdline = read_path(arg(frame, 0));
    match process::execute(&cmdline) {
        Ok(tid) => tid.as_i32(),
        Err(_) => -1,
    }
}

fn sys_create(frame: &IntrFrame) -> bool {
    let path = read_path(arg(frame, 0));
    let size = arg(frame, 1) as usize;

    fs::with_file_system(|| filesystem::create(&path, size))
}

fn sys_remove(frame: &IntrFrame) -> bool {
    let path = read_path(arg(frame, 0));

    fs::with_file_system(|| filesystem::remove(&path))
}

fn sys_open(frame: &IntrFrame) -> i32 {
    let path = read_path(arg(frame, 0));
    let process = current_process();

    let file = fs::with_file_system(|| filesystem::open(&path));
    match file {
        Some(file) => process.insert_fd(file),
        None => -1,
    }
}

fn sys_filesize(frame: &IntrFrame) -> i32 {
    let fd = arg(frame, 0) as i32;
    match current_process().fd_file(fd) {
        Some(file) => fs::with_file_system(|| file.length()) as i32,
        None => 0,
    }
}

fn sys_read(frame: &IntrFrame) -> i32 {
    let fd = arg(frame, 0) as i32;
    let buf = VirtAddr::new(arg(frame, 1));
    let size = arg(frame, 2) as usize;

    // fd 0 reads one byte per call from the console.
    if fd == 0 {
        if size == 0 {
            return 0;
        }

        let byte = console::input_getc();
        if usermem::write_bytes(buf, &[byte]).is_err() {
            kill();
        }

        return 1;
    }

    let file = match current_process().fd_file(fd) {
        Some(file) => file,
        None => return -1,
    };

    let mut kernel_buf = vec![0u8; size];
    let n = fs::with_file_system(|| file.read(&mut kernel_buf));
    if usermem::write_bytes(buf, &kernel_buf[..n]).is_err() {
        kill();
    }

    n as i32
}

fn sys_write(frame: &IntrFrame) -> i32 {
    let fd = arg(frame, 0) as i32;
    let buf = VirtAddr::new(arg(frame, 1));
    let size = arg(frame, 2) as usize;

    // The user buffer is copied into the kernel before any
    // lock is taken, resolving its page faults here.
    let bytes = match usermem::read_bytes(buf, size) {
        Ok(bytes) => bytes,
        Err(_) => kill(),
    };

    // fd 1 writes to the console.
    if fd == 1 {
        console::putbuf(&bytes);
        return size as i32;
    }

    let file = match current_process().fd_file(fd) {
        Some(file) => file,
        None => return -1,
    };

    fs::with_file_system(|| file.write(&bytes)) as i32
}

fn sys_seek(frame: &IntrFrame) {
    let fd = arg(frame, 0) as i32;
    let position = arg(frame, 1) as usize;

    if let Some(file) = current_process().fd_file(fd) {
        fs::with_file_system(|| file.seek(position));
    }
}

fn sys_tell(frame: &IntrFrame) -> u32 {
    let fd = arg(frame, 0) as i32;
    match current_process().fd_file(fd) {
        Some(file) => fs::with_file_system(|| file.tell()) as u32,
        None => 0,
    }
}

fn sys_close(frame: &IntrFrame) {
    let fd = arg(frame, 0) as i32;
    let process = current_process();
    if let Some(file) = process.remove_fd(fd) {
        fs::with_file_system(|| drop(file));
    }
}

fn current_process() -> std::sync::Arc<process::Process> {
    match thread::current().process() {
        Some(process) => process,
        None => kill(),
    }
}
