// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Loads ELF executables into a user address space.
//!
//! The loader validates the executable header, registers every
//! loadable segment lazily in the supplemental page table (no
//! page is read from disk until it is first touched), builds
//! the initial stack page with the program's arguments, and
//! denies writes to the executable for as long as it runs.

use super::Process;
use crate::vm::page::{Backing, PageDesc, PageKind};
use crate::vm::pagedir::PageDir;
use crate::vm::usermem;
use crate::{fs, vm};
use filesystem::File;
use log::info;
use memlayout::{VirtAddr, PGSIZE, PHYS_BASE};
use spin::lock;

// The 32-bit little-endian identification prefix, including
// the ELF version.
const ELF_IDENT: [u8; 7] = [0x7f, b'E', b'L', b'F', 1, 1, 1];
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

// Program header types.
const PT_NULL: u32 = 0;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_NOTE: u32 = 4;
const PT_SHLIB: u32 = 5;
const PT_PHDR: u32 = 6;
const PT_STACK: u32 = 0x6474_e551;

// Segment flag: writable.
const PF_W: u32 = 2;

/// Describes an error encountered while loading an
/// executable.
///
#[derive(Debug, Eq, PartialEq)]
pub(super) enum LoadError {
    /// The executable could not be opened.
    OpenFailed,

    /// The executable failed validation.
    BadExecutable(&'static str),

    /// The initial stack could not be built, usually because
    /// the packed arguments exceed one page.
    BadStack,
}

// An ELF32 program header, in its parsed form.
//
struct ProgramHeader {
    p_type: u32,
    offset: u32,
    vaddr: u32,
    filesz: u32,
    memsz: u32,
    flags: u32,
}

impl ProgramHeader {
    fn parse(buf: &[u8; PHDR_SIZE]) -> ProgramHeader {
        ProgramHeader {
            p_type: le32(buf, 0),
            offset: le32(buf, 4),
            vaddr: le32(buf, 8),
            filesz: le32(buf, 16),
            memsz: le32(buf, 20),
            flags: le32(buf, 24),
        }
    }
}

/// Loads the executable named by `argv[0]` into the current
/// process, which must be fresh. Returns the entry point and
/// the initial stack pointer.
///
pub(super) fn load(process: &Process, argv: &[String]) -> Result<(VirtAddr, VirtAddr), LoadError> {
    let name = &argv[0];

    // Create and activate the address space first, so the
    // stack setup below faults into it.
    let pagedir = PageDir::new();
    process.set_pagedir(pagedir.clone());
    vm::pagedir::activate(Some(pagedir));

    let file = match fs::with_file_system(|| filesystem::open(name)) {
        Some(file) => file,
        None => {
            info!("load: {}: open failed", name);
            return Err(LoadError::OpenFailed);
        }
    };

    // The executable stays open until the process exits.
    *lock!(process.executable) = Some(file.clone());

    let entry = load_segments(process, &file).map_err(|err| {
        info!("load: {}: error loading executable", name);
        err
    })?;

    let esp = setup_stack(process, argv)?;

    // Nobody gets to rewrite a running executable.
    fs::with_file_system(|| file.deny_write());

    Ok((entry, esp))
}

// Validates the executable header and registers every
// loadable segment in the supplemental page table. Returns
// the entry point.
//
fn load_segments(process: &Process, file: &File) -> Result<VirtAddr, LoadError> {
    let mut header = [0u8; EHDR_SIZE];
    let header_len = fs::with_file_system(|| file.read_at(0, &mut header));
    if header_len != EHDR_SIZE {
        return Err(LoadError::BadExecutable("truncated ELF header"));
    }

    if header[..ELF_IDENT.len()] != ELF_IDENT {
        return Err(LoadError::BadExecutable("not a 32-bit little-endian ELF binary"));
    }

    if le16(&header, 16) != ET_EXEC {
        return Err(LoadError::BadExecutable("not an executable"));
    }

    if le16(&header, 18) != EM_386 {
        return Err(LoadError::BadExecutable("wrong machine type"));
    }

    if le32(&header, 20) != 1 {
        return Err(LoadError::BadExecutable("wrong ELF version"));
    }

    if le16(&header, 42) as usize != PHDR_SIZE {
        return Err(LoadError::BadExecutable("wrong program header size"));
    }

    let ph_count = le16(&header, 44) as usize;
    if ph_count > 1024 {
        return Err(LoadError::BadExecutable("too many program headers"));
    }

    let entry = VirtAddr::new(le32(&header, 24));
    let ph_offset = le32(&header, 28) as usize;
    let file_len = fs::with_file_system(|| file.length());

    for i in 0..ph_count {
        let offset = ph_offset + i * PHDR_SIZE;
        if offset + PHDR_SIZE > file_len {
            return Err(LoadError::BadExecutable("program headers outside the file"));
        }

        let mut buf = [0u8; PHDR_SIZE];
        let n = fs::with_file_system(|| file.read_at(offset, &mut buf));
        if n != PHDR_SIZE {
            return Err(LoadError::BadExecutable("truncated program header"));
        }

        let phdr = ProgramHeader::parse(&buf);
        match phdr.p_type {
            PT_NULL | PT_NOTE | PT_PHDR | PT_STACK => {}
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => {
                return Err(LoadError::BadExecutable("unsupported segment type"));
            }
            PT_LOAD => {
                validate_segment(&phdr, file_len)?;
                register_segment(process, file, &phdr)?;
            }
            _ => {}
        }
    }

    Ok(entry)
}

// Checks that a loadable segment is safe to map.
//
fn validate_segment(phdr: &ProgramHeader, file_len: usize) -> Result<(), LoadError> {
    // The file data and the memory image must start at the
    // same offset within a page.
    if phdr.offset as usize % PGSIZE != phdr.vaddr as usize % PGSIZE {
        return Err(LoadError::BadExecutable("misaligned segment"));
    }

    if phdr.offset as usize > file_len {
        return Err(LoadError::BadExecutable("segment outside the file"));
    }

    if phdr.memsz < phdr.filesz {
        return Err(LoadError::BadExecutable("segment larger on disk than in memory"));
    }

    if phdr.memsz == 0 {
        return Err(LoadError::BadExecutable("empty segment"));
    }

    let start = VirtAddr::new(phdr.vaddr);
    let end = match phdr.vaddr.checked_add(phdr.memsz) {
        Some(end) => VirtAddr::new(end),
        None => return Err(LoadError::BadExecutable("segment wraps the address space")),
    };

    if !start.is_user() || !end.is_user() {
        return Err(LoadError::BadExecutable("segment outside user space"));
    }

    // Mapping page 0 would make user null pointers valid.
    if (start.as_usize()) < PGSIZE {
        return Err(LoadError::BadExecutable("segment maps page 0"));
    }

    Ok(())
}

// Registers a validated segment's pages lazily: each page
// records how many bytes to read from the file and how many
// to zero when it is first touched.
//
fn register_segment(process: &Process, file: &File, phdr: &ProgramHeader) -> Result<(), LoadError> {
    let writable = phdr.flags & PF_W != 0;
    let page_offset = phdr.vaddr as usize % PGSIZE;
    let mut file_page = phdr.offset as usize - page_offset;
    let mut upage = VirtAddr::new(phdr.vaddr).page_base();

    let (mut read_bytes, mut zero_bytes) = if phdr.filesz > 0 {
        let read = page_offset + phdr.filesz as usize;
        let total = VirtAddr::new((page_offset + phdr.memsz as usize) as u32)
            .page_round_up()
            .as_usize();
        (read, total - read)
    } else {
        let total = VirtAddr::new((page_offset + phdr.memsz as usize) as u32)
            .page_round_up()
            .as_usize();
        (0, total)
    };

    let table = process.spt();
    let guard = table.lock().clone();
    guard.acquire();

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PGSIZE);
        let page_zero = PGSIZE - page_read;

        let page = if page_read > 0 {
            PageDesc::new(
                upage,
                writable,
                PageKind::FILESYS,
                Backing::File {
                    file: file.clone(),
                    offset: file_page,
                    read_bytes: page_read,
                    zero_bytes: page_zero,
                },
            )
        } else {
            PageDesc::new(upage, writable, PageKind::ZERO, Backing::Zero)
        };

        if !table.insert(page) {
            guard.release();
            return Err(LoadError::BadExecutable("overlapping segments"));
        }

        read_bytes -= page_read;
        zero_bytes -= page_zero;
        file_page += PGSIZE;
        upage = upage + PGSIZE;
    }

    guard.release();
    Ok(())
}

// Builds the initial user stack: a single zero page just
// below PHYS_BASE, with the argument vector packed at the
// top.
//
fn setup_stack(process: &Process, argv: &[String]) -> Result<VirtAddr, LoadError> {
    let stack_page = PHYS_BASE - PGSIZE;

    {
        let table = process.spt();
        let guard = table.lock().clone();
        guard.acquire();
        let inserted = table.insert(PageDesc::new(
            stack_page,
            true,
            PageKind::ZERO,
            Backing::Zero,
        ));
        guard.release();

        if !inserted {
            return Err(LoadError::BadStack);
        }
    }

    // The strings, the alignment padding, the argv array and
    // its null sentinel, argv, argc and the fake return
    // address must all fit in the stack page.
    let strings: usize = argv.iter().map(|arg| arg.len() + 1).sum();
    let packed = strings + 3 + 4 * (argv.len() + 1) + 12;
    if packed > PGSIZE {
        return Err(LoadError::BadStack);
    }

    let mut esp = PHYS_BASE;
    let mut pointers = vec![VirtAddr::zero(); argv.len()];

    // Push the strings themselves, last argument first, and
    // remember where each one lands.
    for (i, arg) in argv.iter().enumerate().rev() {
        esp = esp - (arg.len() + 1);
        pointers[i] = esp;
        write_stack(esp, arg.as_bytes())?;
        write_stack(esp + arg.len(), &[0])?;
    }

    // Pad down to a word boundary.
    while esp.as_usize() % 4 != 0 {
        esp = esp - 1_usize;
        write_stack(esp, &[0])?;
    }

    // argv[argc] is null by definition.
    esp = esp - 4_usize;
    write_stack_word(esp, 0)?;

    // The argv entries, in reverse, so argv[0] ends lowest.
    for pointer in pointers.iter().rev() {
        esp = esp - 4_usize;
        write_stack_word(esp, pointer.as_u32())?;
    }

    // argv, argc and a fake return address.
    let argv_base = esp;
    esp = esp - 4_usize;
    write_stack_word(esp, argv_base.as_u32())?;
    esp = esp - 4_usize;
    write_stack_word(esp, argv.len() as u32)?;
    esp = esp - 4_usize;
    write_stack_word(esp, 0)?;

    Ok(esp)
}

fn write_stack(addr: VirtAddr, bytes: &[u8]) -> Result<(), LoadError> {
    usermem::write_bytes(addr, bytes).map_err(|_| LoadError::BadStack)
}

fn write_stack_word(addr: VirtAddr, word: u32) -> Result<(), LoadError> {
    usermem::write_u32(addr, word).map_err(|_| LoadError::BadStack)
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
