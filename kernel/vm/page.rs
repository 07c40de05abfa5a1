// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the supplemental page table.
//!
//! The page directory only knows about pages that are resident
//! in a frame. The supplemental page table records every page
//! a process *may* touch and where its contents live: nowhere
//! yet (zero pages), in the executable file, in a swap slot,
//! or in a memory-mapped file. The page-fault handler resolves
//! faults from these descriptors.
//!
//! Descriptors are shared with the frame table through an
//! `Arc`, so the eviction sweep can flip a page out of memory
//! without taking the owning process's table lock; those state
//! transitions are serialised by the frame allocation lock
//! instead.

use crate::multitasking::sync::Lock;
use crate::vm::swap::Slot;
use bitflags::bitflags;
use filesystem::File;
use memlayout::VirtAddr;
use spin::{lock, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;

bitflags! {
    /// Where a page's contents currently live. `IN_MEMORY` is
    /// set exactly while a frame-table entry points at the
    /// page's descriptor.
    ///
    pub struct PageKind: u8 {
        const IN_MEMORY = 1 << 0;
        const ZERO      = 1 << 1;
        const FILESYS   = 1 << 2;
        const SWAP      = 1 << 3;
        const MMAP      = 1 << 4;
    }
}

/// The backing store a page is filled from on a fault.
///
#[derive(Clone)]
pub enum Backing {
    /// A fresh zero-filled page.
    Zero,

    /// Bytes from a file, with the tail of the page zeroed.
    File {
        file: File,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },

    /// A swap slot owned by this page.
    Swap(Slot),

    /// A range of a memory-mapped file.
    Mmap {
        mapid: i32,
        offset: usize,
        length: usize,
    },
}

/// The mutable state of one page.
///
pub struct PageState {
    pub kind: PageKind,
    pub writable: bool,
    pub backing: Backing,
}

/// Describes one user page of a process.
///
pub struct PageDesc {
    vaddr: VirtAddr,
    state: Mutex<PageState>,
}

impl PageDesc {
    pub(crate) fn new(vaddr: VirtAddr, writable: bool, kind: PageKind, backing: Backing) -> Arc<Self> {
        debug_assert!(vaddr.is_page_aligned());
        Arc::new(PageDesc {
            vaddr,
            state: Mutex::new(PageState {
                kind,
                writable,
                backing,
            }),
        })
    }

    /// Returns the user virtual address of the page.
    ///
    pub fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    /// Runs `f` on the page's mutable state.
    ///
    pub(crate) fn with_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PageState) -> R,
    {
        f(&mut lock!(self.state))
    }

    /// Returns a snapshot of the page's kind bits.
    ///
    pub fn kind(&self) -> PageKind {
        lock!(self.state).kind
    }

    /// Returns whether the page is writable.
    ///
    pub fn writable(&self) -> bool {
        lock!(self.state).writable
    }
}

/// A process's supplemental page table: every page it may
/// touch, keyed by user virtual address.
///
pub struct SupplementalPageTable {
    // Serialises logical operations on the table: fault
    // resolution, segment registration, unmapping, teardown.
    table_lock: Lock,

    pages: Mutex<BTreeMap<u32, Arc<PageDesc>>>,
}

impl SupplementalPageTable {
    pub(crate) fn new() -> Self {
        SupplementalPageTable {
            table_lock: Lock::new(),
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn lock(&self) -> &Lock {
        &self.table_lock
    }

    /// Registers a page. Returns false if a page is already
    /// registered at that address.
    ///
    pub(crate) fn insert(&self, page: Arc<PageDesc>) -> bool {
        let mut pages = lock!(self.pages);
        if pages.contains_key(&page.vaddr().as_u32()) {
            return false;
        }

        pages.insert(page.vaddr().as_u32(), page);

        true
    }

    /// Looks up the page containing the given address.
    ///
    pub fn lookup(&self, vaddr: VirtAddr) -> Option<Arc<PageDesc>> {
        lock!(self.pages).get(&vaddr.page_base().as_u32()).cloned()
    }

    pub(crate) fn remove(&self, vaddr: VirtAddr) -> Option<Arc<PageDesc>> {
        lock!(self.pages).remove(&vaddr.page_base().as_u32())
    }

    /// Returns every registered page descriptor.
    ///
    pub(crate) fn pages(&self) -> Vec<Arc<PageDesc>> {
        lock!(self.pages).values().cloned().collect()
    }
}
