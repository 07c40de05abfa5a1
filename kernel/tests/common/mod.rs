// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Shared machinery for the kernel scenario tests: a lock
//! that serialises tests (the kernel is one global machine),
//! boot helpers, and a builder for small ELF executables.

#![allow(dead_code)]

use kernel::BootOptions;
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serialises the tests in a binary: each test boots and
/// drives the one global machine.
///
pub fn machine() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Boots the machine with default options and returns the
/// test serialisation guard.
///
pub fn boot() -> MutexGuard<'static, ()> {
    boot_with(BootOptions::default())
}

/// Boots the machine with the given options and returns the
/// test serialisation guard.
///
pub fn boot_with(options: BootOptions) -> MutexGuard<'static, ()> {
    let guard = machine();
    kernel::boot(options);

    guard
}

/// A loadable segment for [`build_elf`].
///
pub struct Segment {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
    pub writable: bool,
}

impl Segment {
    /// A code/data segment whose memory image equals its file
    /// image.
    ///
    pub fn data(vaddr: u32, data: &[u8]) -> Segment {
        Segment {
            vaddr,
            data: data.to_vec(),
            memsz: data.len() as u32,
            writable: false,
        }
    }

    /// A zero-filled writable segment with no file image.
    ///
    pub fn bss(vaddr: u32, memsz: u32) -> Segment {
        Segment {
            vaddr,
            data: Vec::new(),
            memsz,
            writable: true,
        }
    }
}

const PGSIZE: u32 = 4096;
const EHDR_SIZE: u32 = 52;
const PHDR_SIZE: u32 = 32;

/// Assembles a 32-bit little-endian x86 executable from the
/// given segments.
///
pub fn build_elf(entry: u32, segments: &[Segment]) -> Vec<u8> {
    // Lay the segment file images out after the headers, each
    // placed so its file offset is congruent to its virtual
    // address modulo the page size.
    let headers_end = EHDR_SIZE + PHDR_SIZE * segments.len() as u32;
    let mut offsets = Vec::new();
    let mut cursor = headers_end;
    for segment in segments {
        let offset = align_up(cursor, PGSIZE) + segment.vaddr % PGSIZE;
        offsets.push(offset);
        cursor = offset + segment.data.len() as u32;
    }

    let mut image = vec![0u8; cursor as usize];

    // The ELF header.
    image[..7].copy_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1]);
    put16(&mut image, 16, 2); // e_type: ET_EXEC
    put16(&mut image, 18, 3); // e_machine: EM_386
    put32(&mut image, 20, 1); // e_version
    put32(&mut image, 24, entry);
    put32(&mut image, 28, EHDR_SIZE); // e_phoff
    put16(&mut image, 40, EHDR_SIZE as u16); // e_ehsize
    put16(&mut image, 42, PHDR_SIZE as u16); // e_phentsize
    put16(&mut image, 44, segments.len() as u16); // e_phnum

    // One PT_LOAD program header per segment.
    for (i, segment) in segments.iter().enumerate() {
        let base = (EHDR_SIZE + PHDR_SIZE * i as u32) as usize;
        let flags = if segment.writable { 4 | 2 } else { 4 | 1 };
        put32(&mut image, base, 1); // p_type: PT_LOAD
        put32(&mut image, base + 4, offsets[i]);
        put32(&mut image, base + 8, segment.vaddr);
        put32(&mut image, base + 12, segment.vaddr); // p_paddr
        put32(&mut image, base + 16, segment.data.len() as u32);
        put32(&mut image, base + 20, segment.memsz);
        put32(&mut image, base + 24, flags);
        put32(&mut image, base + 28, PGSIZE); // p_align

        image[offsets[i] as usize..offsets[i] as usize + segment.data.len()]
            .copy_from_slice(&segment.data);
    }

    image
}

fn align_up(value: u32, to: u32) -> u32 {
    (value + to - 1) / to * to
}

fn put16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}
