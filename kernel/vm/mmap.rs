// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements memory-mapped files.
//!
//! A mapping lays an open file over a run of user pages. The
//! pages are registered lazily; the first touch of each page
//! reads the corresponding file range, and eviction writes a
//! dirty page straight back to the file rather than to swap.
//! Unmapping writes every resident dirty page back and removes
//! the registration.

use super::page::{Backing, PageDesc, PageKind};
use super::{frame, pagedir};
use crate::multitasking::thread;
use crate::{fs, process};
use memlayout::{VirtAddr, PGSIZE};

/// Maps the open file `fd` of the current process at `addr`.
///
/// Returns the mapping id, or `None` if the descriptor is not
/// an open file, the file is empty, the address is not
/// page-aligned (or is page 0), or the range overlaps pages
/// the process already uses.
///
pub fn mmap(fd: i32, addr: VirtAddr) -> Option<i32> {
    let process = thread::current().process()?;
    let file = process.fd_file(fd)?;
    let length = fs::with_file_system(|| file.length());

    if length == 0 || !addr.is_page_aligned() || addr.as_usize() < PGSIZE {
        return None;
    }

    let pages = (length + PGSIZE - 1) / PGSIZE;
    let end = addr.checked_add(pages * PGSIZE)?;
    if !end.is_user() && end != memlayout::PHYS_BASE {
        return None;
    }

    let table = process.spt();
    let guard = table.lock().clone();
    guard.acquire();

    for i in 0..pages {
        if table.lookup(addr + i * PGSIZE).is_some() {
            guard.release();
            return None;
        }
    }

    let mapid = process.insert_mapping(file.clone(), addr, pages);
    for i in 0..pages {
        let offset = i * PGSIZE;
        let page_len = PGSIZE.min(length - offset);
        let page = PageDesc::new(
            addr + offset,
            true,
            PageKind::MMAP,
            Backing::Mmap {
                mapid,
                offset,
                length: page_len,
            },
        );
        table.insert(page);
    }

    guard.release();
    Some(mapid)
}

/// Removes the mapping with the given id from the current
/// process, writing resident dirty pages back to the file.
///
/// Returns whether the mapping existed.
///
pub fn munmap(mapid: i32) -> bool {
    let process = match thread::current().process() {
        Some(process) => process,
        None => return false,
    };

    let mapping = match process.mapping(mapid) {
        Some(mapping) => mapping,
        None => return false,
    };

    let table = process.spt();
    let guard = table.lock().clone();
    guard.acquire();

    // The allocation lock keeps evictions out while pages are
    // written back and their frames freed.
    let pagedir = process.pagedir().expect("mmap in a process with no address space");
    frame::with_allocation_lock(|| {
        for i in 0..mapping.pages {
            let vaddr = mapping.base + i * PGSIZE;
            let page = match table.remove(vaddr) {
                Some(page) => page,
                None => continue,
            };

            write_back_resident(&process, &pagedir, &page);
        }

        process.remove_mapping(mapid);
    });

    guard.release();

    true
}

/// Removes every mapping of the current process, at exit.
///
pub(crate) fn munmap_all() {
    let process = match thread::current().process() {
        Some(process) => process,
        None => return,
    };

    for mapid in process.mapping_ids() {
        munmap(mapid);
    }
}

// Writes one mapped page back to its file if it is resident
// and dirty, then releases its frame.
//
fn write_back_resident(process: &process::Process, pagedir: &pagedir::PageDir, page: &PageDesc) {
    let (frame, _) = match pagedir.lookup(page.vaddr()) {
        Some(mapping) => mapping,
        None => return,
    };

    if pagedir.is_dirty(page.vaddr()) {
        if let Backing::Mmap { mapid, offset, length } = page.with_state(|s| s.backing.clone()) {
            let file = process.mapping_file(mapid).expect("mapping vanished during munmap");
            let mut buf = vec![0u8; length];
            physmem::read(frame, 0, &mut buf);
            fs::with_file_system(|| file.write_at(offset, &buf));
        }
    }

    frame::free_user_page(frame, true);
}
