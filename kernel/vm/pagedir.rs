// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements per-process page directories.
//!
//! A page directory maps user virtual pages to physical frames
//! with a writable flag and the accessed and dirty bits the
//! eviction policy reads. It stands in for the MMU's page
//! tables: user memory accessors consult the active directory
//! and update the bits on every access.

use lazy_static::lazy_static;
use memlayout::VirtAddr;
use physmem::Frame;
use spin::{lock, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Copy)]
struct Entry {
    frame: Frame,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A per-process page directory.
///
/// `PageDir` is a cheap handle; clones refer to the same
/// directory.
///
#[derive(Clone)]
pub struct PageDir {
    entries: Arc<Mutex<BTreeMap<u32, Entry>>>,
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir {
    /// Returns a new, empty page directory.
    ///
    pub fn new() -> Self {
        PageDir {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Maps a user page to a frame. Returns false if the page
    /// is already mapped.
    ///
    pub(crate) fn set_page(&self, upage: VirtAddr, frame: Frame, writable: bool) -> bool {
        debug_assert!(upage.is_page_aligned());

        let mut entries = lock!(self.entries);
        if entries.contains_key(&upage.as_u32()) {
            return false;
        }

        entries.insert(
            upage.as_u32(),
            Entry {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );

        true
    }

    /// Returns the frame a user page maps to, and whether the
    /// mapping is writable.
    ///
    pub(crate) fn lookup(&self, upage: VirtAddr) -> Option<(Frame, bool)> {
        let entries = lock!(self.entries);
        entries.get(&upage.page_base().as_u32()).map(|e| (e.frame, e.writable))
    }

    /// Removes the mapping for a user page, discarding its
    /// accessed and dirty bits.
    ///
    pub(crate) fn clear_page(&self, upage: VirtAddr) {
        lock!(self.entries).remove(&upage.page_base().as_u32());
    }

    pub(crate) fn is_accessed(&self, upage: VirtAddr) -> bool {
        lock!(self.entries)
            .get(&upage.page_base().as_u32())
            .map(|e| e.accessed)
            .unwrap_or(false)
    }

    pub(crate) fn clear_accessed(&self, upage: VirtAddr) {
        if let Some(entry) = lock!(self.entries).get_mut(&upage.page_base().as_u32()) {
            entry.accessed = false;
        }
    }

    pub(crate) fn is_dirty(&self, upage: VirtAddr) -> bool {
        lock!(self.entries)
            .get(&upage.page_base().as_u32())
            .map(|e| e.dirty)
            .unwrap_or(false)
    }

    // Records an access to the page, as the MMU would on a
    // load or store.
    //
    pub(crate) fn mark_accessed(&self, upage: VirtAddr, write: bool) {
        if let Some(entry) = lock!(self.entries).get_mut(&upage.page_base().as_u32()) {
            entry.accessed = true;
            if write {
                entry.dirty = true;
            }
        }
    }

    /// Removes every mapping. Called only after the process's
    /// frames have been returned to their pools.
    ///
    pub(crate) fn destroy(&self) {
        lock!(self.entries).clear();
    }

    /// Returns the number of pages currently mapped.
    ///
    pub fn mapped_pages(&self) -> usize {
        lock!(self.entries).len()
    }
}

lazy_static! {
    // The page directory the "MMU" currently translates user
    // addresses through; None selects the kernel's base
    // directory, which maps no user pages.
    //
    static ref ACTIVE: Mutex<Option<PageDir>> = Mutex::new(None);
}

pub(crate) fn init() {
    *lock!(ACTIVE) = None;
}

/// Activates the given page directory, or the kernel's base
/// directory for `None`. Called on every context switch.
///
pub(crate) fn activate(pagedir: Option<PageDir>) {
    *lock!(ACTIVE) = pagedir;
}

/// Returns the active page directory, if a user one is
/// active.
///
pub(crate) fn active() -> Option<PageDir> {
    lock!(ACTIVE).clone()
}
