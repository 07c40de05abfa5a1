// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Scenario tests for the process layer: exec, wait, argument
//! passing and the system call surface.

mod common;

use common::Segment;
use kernel::process::usermode::register_user_program;
use kernel::process::{self, ExecError};
use kernel::syscall::{
    SYS_CLOSE, SYS_CREATE, SYS_FILESIZE, SYS_HALT, SYS_OPEN, SYS_READ, SYS_REMOVE, SYS_SEEK,
    SYS_TELL, SYS_WRITE,
};
use kernel::{console, power, thread};
use memlayout::VirtAddr;
use std::sync::{Arc, Mutex};

// A minimal valid executable: one read-only segment holding a
// few instruction bytes, entered at its base.
fn trivial_elf() -> Vec<u8> {
    common::build_elf(0x0804_8000, &[Segment::data(0x0804_8000, &[0x90, 0x90, 0xc3])])
}

fn install(name: &str, image: &[u8]) {
    kernel::with_file_system(|| filesystem::install(name, image));
}

#[test]
fn exec_missing_executable_fails() {
    let _machine = common::boot();

    // The caller gets an error rather than blocking forever.
    assert_eq!(process::execute("no-such-binary").unwrap_err(), ExecError::LoadFailed);
    assert_eq!(process::execute("").unwrap_err(), ExecError::BadCommandLine);
}

#[test]
fn exec_rejects_bad_elf() {
    let _machine = common::boot();

    install("truncated", &[0x7f, b'E', b'L', b'F', 1]);
    assert_eq!(process::execute("truncated").unwrap_err(), ExecError::LoadFailed);

    // A dynamic segment is fatal even when everything else is
    // valid.
    let mut image = trivial_elf();
    image[52] = 2; // p_type: PT_DYNAMIC
    install("dynamic", &image);
    assert_eq!(process::execute("dynamic").unwrap_err(), ExecError::LoadFailed);

    // 64-bit binaries are rejected.
    let mut image = trivial_elf();
    image[4] = 2; // ELFCLASS64
    install("class64", &image);
    assert_eq!(process::execute("class64").unwrap_err(), ExecError::LoadFailed);
}

#[test]
fn exec_wait_exit_status() {
    let _machine = common::boot();

    install("hello", &trivial_elf());
    register_user_program("hello", |_context| 42);

    let child = process::execute("hello").expect("exec failed");
    assert_eq!(process::wait(child), 42);

    // A child can be waited for only once.
    assert_eq!(process::wait(child), -1);

    // Waiting for a thread that is not a child fails.
    assert_eq!(process::wait(thread::current_tid()), -1);

    let output = console::take_output();
    assert!(output.contains("hello: exit(42)\n"), "console output: {:?}", output);
}

#[test]
fn argument_packing() {
    let _machine = common::boot();

    install("echo", &trivial_elf());

    #[derive(Default)]
    struct Observed {
        esp: u32,
        ret: u32,
        argc: u32,
        argv_null: u32,
        args: Vec<String>,
    }

    let observed: Arc<Mutex<Observed>> = Arc::new(Mutex::new(Observed::default()));
    let sink = observed.clone();
    register_user_program("echo", move |context| {
        let esp = context.esp();
        let argc = context.load_u32(esp + 4);
        let argv = VirtAddr::new(context.load_u32(esp + 8));

        let mut observed = sink.lock().unwrap();
        observed.esp = esp.as_u32();
        observed.ret = context.load_u32(esp);
        observed.argc = argc;
        observed.argv_null = context.load_u32(argv + 4 * argc as usize);
        for i in 0..argc as usize {
            let arg = VirtAddr::new(context.load_u32(argv + 4 * i));
            let mut bytes = Vec::new();
            loop {
                let byte = context.load(arg + bytes.len(), 1)[0];
                if byte == 0 {
                    break;
                }

                bytes.push(byte);
            }

            observed.args.push(String::from_utf8(bytes).unwrap());
        }

        0
    });

    let child = process::execute("echo a b").expect("exec failed");
    assert_eq!(process::wait(child), 0);

    let observed = observed.lock().unwrap();
    assert_eq!(observed.esp % 4, 0);
    assert_eq!(observed.ret, 0);
    assert_eq!(observed.argc, 3);
    assert_eq!(observed.argv_null, 0);
    assert_eq!(observed.args, vec!["echo", "a", "b"]);
}

#[test]
fn file_syscalls() {
    let _machine = common::boot();

    install("fileio", &trivial_elf());
    console::feed_input(b"z");

    register_user_program("fileio", |context| {
        // Scratch space in the stack page, well below esp.
        let scratch = context.esp() - 512_usize;

        if context.syscall(SYS_CREATE, &[path(context, scratch, "data"), 16]) != 1 {
            return 1;
        }

        let fd = context.syscall(SYS_OPEN, &[path(context, scratch, "data")]);
        if fd < 2 {
            return 2;
        }

        if context.syscall(SYS_FILESIZE, &[fd as u32]) != 16 {
            return 3;
        }

        let buf = scratch + 64_usize;
        context.store(buf, b"petrel!");
        if context.syscall(SYS_WRITE, &[fd as u32, buf.as_u32(), 7]) != 7 {
            return 4;
        }

        context.syscall(SYS_SEEK, &[fd as u32, 0]);
        if context.syscall(SYS_TELL, &[fd as u32]) != 0 {
            return 5;
        }

        let readback = scratch + 128_usize;
        if context.syscall(SYS_READ, &[fd as u32, readback.as_u32(), 7]) != 7 {
            return 6;
        }

        if context.load(readback, 7) != b"petrel!" {
            return 7;
        }

        // fd 0 reads one byte per call from the console.
        if context.syscall(SYS_READ, &[0, readback.as_u32(), 4]) != 1 {
            return 8;
        }

        if context.load(readback, 1) != b"z" {
            return 9;
        }

        // fd 1 writes to the console.
        if context.syscall(SYS_WRITE, &[1, buf.as_u32(), 7]) != 7 {
            return 10;
        }

        context.syscall(SYS_CLOSE, &[fd as u32]);
        if context.syscall(SYS_WRITE, &[fd as u32, buf.as_u32(), 7]) != -1 {
            return 11;
        }

        if context.syscall(SYS_REMOVE, &[path(context, scratch, "data")]) != 1 {
            return 12;
        }

        0
    });

    let child = process::execute("fileio").expect("exec failed");
    assert_eq!(process::wait(child), 0);

    let output = console::take_output();
    assert!(output.contains("petrel!"), "console output: {:?}", output);
}

// Stores a NUL-terminated path at `at` in user memory and
// returns its address as a syscall argument.
fn path(context: &kernel::process::usermode::UserContext, at: VirtAddr, name: &str) -> u32 {
    context.store(at, name.as_bytes());
    context.store(at + name.len(), &[0]);

    at.as_u32()
}

#[test]
fn bad_pointers_kill_the_process() {
    let _machine = common::boot();

    install("crash", &trivial_elf());
    register_user_program("crash", |context| {
        // A write with a kernel-space buffer never returns.
        context.syscall(SYS_WRITE, &[1, 0xc000_0000, 4]);
        7
    });

    let child = process::execute("crash").expect("exec failed");
    assert_eq!(process::wait(child), -1);

    let output = console::take_output();
    assert!(output.contains("crash: exit(-1)\n"), "console output: {:?}", output);
}

#[test]
fn executable_write_denied_while_running() {
    let _machine = common::boot();

    let image = trivial_elf();
    install("denied", &image);

    let loaded = Arc::new(kernel::sync::Semaphore::new(0));
    let hold = Arc::new(kernel::sync::Semaphore::new(0));
    let signal = loaded.clone();
    let held = hold.clone();
    register_user_program("denied", move |_context| {
        signal.up();
        held.down();
        0
    });

    // While the child runs, its executable cannot be
    // modified; once it has exited, it can.
    let child = process::execute("denied").expect("exec failed");
    loaded.down();

    let file = kernel::with_file_system(|| filesystem::open("denied")).expect("open failed");
    assert_eq!(kernel::with_file_system(|| file.write_at(0, b"X")), 0);

    hold.up();
    assert_eq!(process::wait(child), 0);
    assert_eq!(kernel::with_file_system(|| file.write_at(0, &image[..1])), 1);
}

#[test]
fn halt_stops_the_machine() {
    let _machine = common::boot();

    install("halter", &trivial_elf());
    register_user_program("halter", |context| {
        context.syscall(SYS_HALT, &[]);
        unreachable!("halt returned");
    });

    process::execute("halter").expect("exec failed");
    while !power::halted() {
        thread::yield_now();
    }
}
