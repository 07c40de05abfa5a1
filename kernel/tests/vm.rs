// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Scenario tests for the virtual memory system: demand
//! paging, eviction to swap, and memory-mapped files.

mod common;

use common::Segment;
use kernel::process;
use kernel::process::usermode::register_user_program;
use kernel::syscall::SYS_OPEN;
use kernel::vm::{frame, mmap, swap};
use kernel::BootOptions;
use memlayout::{VirtAddr, PGSIZE};

fn install(name: &str, image: &[u8]) {
    kernel::with_file_system(|| filesystem::install(name, image));
}

#[test]
fn eviction_under_memory_pressure() {
    // More pages than frames: the process touches 12 pages of
    // zero-filled memory (plus its stack) on a machine with 8
    // user frames, forcing eviction to swap, and must read
    // back exactly what it wrote.
    let _machine = common::boot_with(BootOptions {
        user_frames: 8,
        swap_slots: 64,
        ..BootOptions::default()
    });

    const BASE: u32 = 0x1000_0000;
    const PAGES: usize = 12;

    let image = common::build_elf(BASE, &[Segment::bss(BASE, (PAGES * PGSIZE) as u32)]);
    install("toucher", &image);

    register_user_program("toucher", |context| {
        for i in 0..PAGES {
            let page = VirtAddr::new(BASE) + i * PGSIZE;
            context.store(page + 16_usize, &[i as u8; 64]);
        }

        for i in 0..PAGES {
            let page = VirtAddr::new(BASE) + i * PGSIZE;
            let bytes = context.load(page, PGSIZE);
            if bytes[..16] != [0u8; 16] {
                return 1 + i as i32;
            }

            if bytes[16..80] != [i as u8; 64] {
                return 100 + i as i32;
            }

            if bytes[80..].iter().any(|b| *b != 0) {
                return 200 + i as i32;
            }
        }

        0
    });

    let free_before = physmem::num_free();
    let swap_before = swap::num_free();

    let child = process::execute("toucher").expect("exec failed");
    assert_eq!(process::wait(child), 0);

    // Exit returned every frame and swap slot.
    assert_eq!(physmem::num_free(), free_before);
    assert_eq!(swap::num_free(), swap_before);
    assert_eq!(frame::frames_in_use(), 0);
    frame::check_invariants();
}

#[test]
fn mmap_write_back_and_refault() {
    // A dirty mapped page evicted under pressure is written
    // back to its file; re-faulting it reads the written
    // bytes back. Unmapping flushes the rest.
    let _machine = common::boot_with(BootOptions {
        user_frames: 4,
        swap_slots: 64,
        ..BootOptions::default()
    });

    const MAP_BASE: u32 = 0x2000_0000;
    const SCRATCH: u32 = 0x1000_0000;

    install("blob", &[0xabu8; PGSIZE]);
    let image = common::build_elf(SCRATCH, &[Segment::bss(SCRATCH, (8 * PGSIZE) as u32)]);
    install("mapper", &image);

    register_user_program("mapper", |context| {
        let scratch = VirtAddr::new(SCRATCH);
        let base = VirtAddr::new(MAP_BASE);

        let name = scratch + 64_usize;
        context.store(name, b"blob\0");
        let fd = context.syscall(SYS_OPEN, &[name.as_u32()]);
        if fd < 2 {
            return 1;
        }

        let mapid = match mmap::mmap(fd, base) {
            Some(mapid) => mapid,
            None => return 2,
        };

        // Dirty the mapped page, then touch enough other
        // pages to push it out of memory.
        context.store(base + 100_usize, b"petrel");
        for i in 0..8 {
            context.store(scratch + i * PGSIZE, &[1]);
        }

        // Re-fault the mapped page: the write-back must be
        // visible again, along with the original contents.
        if context.load(base + 100_usize, 6) != b"petrel" {
            return 3;
        }

        if context.load(base, 1) != [0xab] {
            return 4;
        }

        context.store(base + 200_usize, b"again");
        if !mmap::munmap(mapid) {
            return 5;
        }

        0
    });

    let child = process::execute("mapper").expect("exec failed");
    assert_eq!(process::wait(child), 0);

    // Both writes reached the file.
    let file = kernel::with_file_system(|| filesystem::open("blob")).expect("open failed");
    let mut bytes = vec![0u8; PGSIZE];
    assert_eq!(kernel::with_file_system(|| file.read_at(0, &mut bytes)), PGSIZE);
    assert_eq!(&bytes[100..106], b"petrel");
    assert_eq!(&bytes[200..205], b"again");
    assert_eq!(bytes[0], 0xab);
}

#[test]
fn lazily_loaded_segments_read_from_the_executable() {
    let _machine = common::boot();

    const CODE: u32 = 0x0804_8000;
    let payload: Vec<u8> = (0..=255u8).cycle().take(2 * PGSIZE + 123).collect();
    let image = common::build_elf(CODE, &[Segment::data(CODE, &payload)]);
    install("reader", &image);

    let expected = payload.clone();
    register_user_program("reader", move |context| {
        let code = VirtAddr::new(CODE);
        if context.load(code, expected.len()) != expected[..] {
            return 1;
        }

        // The zero tail of the final page really is zero.
        let tail = code + expected.len();
        if context.load(tail, 100).iter().any(|b| *b != 0) {
            return 2;
        }

        0
    });

    let child = process::execute("reader").expect("exec failed");
    assert_eq!(process::wait(child), 0);
}

#[test]
fn faults_outside_the_address_space_kill() {
    let _machine = common::boot();

    let image = common::build_elf(0x0804_8000, &[Segment::data(0x0804_8000, &[0xc3])]);
    install("wild", &image);
    register_user_program("wild", |context| {
        // No page is registered here, so the load never
        // returns.
        context.load(VirtAddr::new(0x3000_0000), 1);
        7
    });

    let child = process::execute("wild").expect("exec failed");
    assert_eq!(process::wait(child), -1);
}

#[test]
fn writes_to_read_only_segments_kill() {
    let _machine = common::boot();

    const CODE: u32 = 0x0804_8000;
    let image = common::build_elf(CODE, &[Segment::data(CODE, &[0xc3])]);
    install("rostore", &image);
    register_user_program("rostore", |context| {
        context.store(VirtAddr::new(CODE), &[0x90]);
        7
    });

    let child = process::execute("rostore").expect("exec failed");
    assert_eq!(process::wait(child), -1);
}
