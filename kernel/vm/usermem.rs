// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements checked access to user memory.
//!
//! Every byte the kernel reads from or writes to a user
//! address goes through these accessors. They translate
//! through the current process's page directory, resolve
//! faults for lazily registered pages, update the accessed and
//! dirty bits the way the MMU would, and report a [`Fault`]
//! for anything invalid: null and kernel pointers, unmapped
//! addresses, and writes through read-only mappings. The
//! caller decides what a fault means; the syscall layer kills
//! the process.

use super::pagedir::PageDir;
use crate::multitasking::thread;
use memlayout::{VirtAddr, PGSIZE};
use physmem::Frame;

/// An invalid user memory access.
///
#[derive(Debug, Eq, PartialEq)]
pub struct Fault;

// Translates one user address for an access of the given
// kind, faulting the page in if necessary.
//
fn translate(pagedir: &PageDir, addr: VirtAddr, write: bool) -> Result<(Frame, usize), Fault> {
    if !addr.is_user() {
        return Err(Fault);
    }

    let upage = addr.page_base();
    loop {
        if let Some((frame, writable)) = pagedir.lookup(upage) {
            if write && !writable {
                return Err(Fault);
            }

            pagedir.mark_accessed(upage, write);
            return Ok((frame, addr.page_offset()));
        }

        super::handle_fault(addr)?;
    }
}

fn current_pagedir() -> Result<PageDir, Fault> {
    thread::current().process().and_then(|p| p.pagedir()).ok_or(Fault)
}

/// Reads `len` bytes of user memory starting at `addr` into a
/// kernel buffer.
///
pub(crate) fn read_bytes(addr: VirtAddr, len: usize) -> Result<Vec<u8>, Fault> {
    let pagedir = current_pagedir()?;
    let mut buf = vec![0u8; len];
    let mut done = 0;
    while done < len {
        let at = addr.checked_add(done).ok_or(Fault)?;
        let (frame, offset) = translate(&pagedir, at, false)?;
        let chunk = (PGSIZE - offset).min(len - done);
        physmem::read(frame, offset, &mut buf[done..done + chunk]);
        done += chunk;
    }

    Ok(buf)
}

/// Writes a kernel buffer into user memory starting at
/// `addr`.
///
pub(crate) fn write_bytes(addr: VirtAddr, bytes: &[u8]) -> Result<(), Fault> {
    let pagedir = current_pagedir()?;
    let mut done = 0;
    while done < bytes.len() {
        let at = addr.checked_add(done).ok_or(Fault)?;
        let (frame, offset) = translate(&pagedir, at, true)?;
        let chunk = (PGSIZE - offset).min(bytes.len() - done);
        physmem::write(frame, offset, &bytes[done..done + chunk]);
        done += chunk;
    }

    Ok(())
}

/// Reads a little-endian word of user memory.
///
pub(crate) fn read_u32(addr: VirtAddr) -> Result<u32, Fault> {
    let bytes = read_bytes(addr, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Writes a little-endian word of user memory.
///
pub(crate) fn write_u32(addr: VirtAddr, value: u32) -> Result<(), Fault> {
    write_bytes(addr, &value.to_le_bytes())
}

/// Reads a NUL-terminated string of at most `max` bytes from
/// user memory.
///
/// Faults if the string is not valid UTF-8 or no terminator
/// appears within `max` bytes.
///
pub(crate) fn read_cstr(addr: VirtAddr, max: usize) -> Result<String, Fault> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let at = addr.checked_add(i).ok_or(Fault)?;
        let byte = read_bytes(at, 1)?[0];
        if byte == 0 {
            return String::from_utf8(bytes).map_err(|_| Fault);
        }

        bytes.push(byte);
    }

    Err(Fault)
}
