// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements demand-paged virtual memory.
//!
//! A process's pages are registered lazily in its supplemental
//! page table; the first touch of a page faults into
//! [`handle_fault`], which finds the page's backing, fills a
//! frame from it (possibly evicting another frame first) and
//! installs the mapping. See the submodules:
//!
//! - [`page`]: the supplemental page table
//! - [`frame`]: the global frame table and eviction
//! - [`swap`]: the swap device interface
//! - [`mmap`]: memory-mapped files
//! - [`pagedir`]: per-process page directories
//! - [`usermem`]: checked access to user memory

pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod swap;
pub(crate) mod usermem;

use crate::multitasking::thread;
use crate::{fs, process};
use memlayout::{VirtAddr, PGSIZE};
use page::{Backing, PageKind};
use physmem::Frame;

pub use usermem::Fault;

pub(crate) fn init(swap_slots: usize) {
    pagedir::init();
    swap::init(swap_slots);
    frame::init();
}

/// Resolves a page fault at `addr` in the current process.
///
/// Returns an error if the address is not a faultable user
/// address or the process has no page registered there; the
/// caller terminates the process in that case.
///
pub(crate) fn handle_fault(addr: VirtAddr) -> Result<(), Fault> {
    // Page 0 stays unmapped so that user null pointers can
    // never be made valid.
    if !addr.is_user() || addr.as_usize() < PGSIZE {
        return Err(Fault);
    }

    let process = thread::current().process().ok_or(Fault)?;
    let table = process.spt();
    let guard = table.lock().clone();
    guard.acquire();

    let result = resolve_fault(&process, addr);

    guard.release();
    result
}

fn resolve_fault(process: &process::Process, addr: VirtAddr) -> Result<(), Fault> {
    let page = match process.spt().lookup(addr) {
        Some(page) => page,
        None => return Err(Fault),
    };

    debug_assert!(!page.kind().contains(PageKind::IN_MEMORY));

    let backing = page.with_state(|state| state.backing.clone());
    frame::get_user_page(&page, |frame| fill_frame(process, frame, &backing));

    // A swapped-in page gives its slot back and becomes
    // anonymous; its next eviction takes a fresh slot.
    if let Backing::Swap(slot) = backing {
        swap::free(slot);
        page.with_state(|state| {
            state.kind.remove(PageKind::SWAP);
            state.backing = Backing::Zero;
        });
    }

    Ok(())
}

// Populates a freshly allocated (zeroed) frame from the
// page's backing store.
//
fn fill_frame(process: &process::Process, frame: Frame, backing: &Backing) {
    match backing {
        Backing::Zero => {}
        Backing::File {
            file,
            offset,
            read_bytes,
            zero_bytes,
        } => {
            let mut buf = vec![0u8; *read_bytes];
            let n = fs::with_file_system(|| file.read_at(*offset, &mut buf));
            physmem::write(frame, 0, &buf[..n]);
            physmem::zero(frame, *read_bytes, *zero_bytes);
        }
        Backing::Swap(slot) => {
            swap::load(*slot, frame);
        }
        Backing::Mmap { mapid, offset, length } => {
            let file = process
                .mapping_file(*mapid)
                .expect("page backed by a missing mmap mapping");
            let mut buf = vec![0u8; *length];
            let n = fs::with_file_system(|| file.read_at(*offset, &mut buf));
            physmem::write(frame, 0, &buf[..n]);
        }
    }
}
