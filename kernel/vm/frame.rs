// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the global frame table and page replacement.
//!
//! Every frame backing a user page has an entry mapping it to
//! the owning thread and the page descriptor it holds. When
//! the user pool runs dry, one frame is evicted: a single
//! sweep of the table picks the frame that has gone unused the
//! longest (second-chance on the accessed bit, preferring
//! clean frames on ties), its contents are written back to the
//! owning file or to a fresh swap slot, and the frame returns
//! to the pool.
//!
//! Two locks guard this module. The allocation lock makes
//! allocate-fill-install-evict a single unit, so eviction can
//! assume no concurrent page-ins. The finer frame-table lock
//! guards only the table itself, so table updates never wait
//! on an eviction's write-back I/O.

use super::page::{Backing, PageDesc, PageKind};
use super::{pagedir, swap};
use crate::multitasking::sync::Lock;
use crate::multitasking::thread::{self, Tid};
use crate::{fs, interrupts};
use lazy_static::lazy_static;
use log::debug;
use physmem::Frame;
use spin::{lock, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;

struct FrameEntry {
    frame: Frame,
    owner: Tid,
    page: Arc<PageDesc>,
    unused_count: i64,
}

lazy_static! {
    static ref FRAMES: Mutex<BTreeMap<usize, FrameEntry>> = Mutex::new(BTreeMap::new());
    static ref TABLE_LOCK: Mutex<Option<Lock>> = Mutex::new(None);
    static ref ALLOCATION_LOCK: Mutex<Option<Lock>> = Mutex::new(None);
}

pub(crate) fn init() {
    lock!(FRAMES).clear();
    *lock!(TABLE_LOCK) = Some(Lock::new());
    *lock!(ALLOCATION_LOCK) = Some(Lock::new());
}

fn table_lock() -> Lock {
    lock!(TABLE_LOCK).clone().expect("frame table not initialised")
}

fn allocation_lock() -> Lock {
    lock!(ALLOCATION_LOCK).clone().expect("frame table not initialised")
}

// Runs `f` with the allocation lock held, so no page-in or
// eviction can interleave with it.
//
pub(crate) fn with_allocation_lock<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let allocation = allocation_lock();
    allocation.acquire();
    let result = f();
    allocation.release();

    result
}

/// Returns the number of entries in the frame table.
///
pub fn frames_in_use() -> usize {
    lock!(FRAMES).len()
}

// Allocates a frame for `page` on behalf of the current
// thread, evicting another frame if the pool is exhausted.
// `fill` is called to populate the frame before the page is
// installed in the page directory and marked in memory.
//
pub(crate) fn get_user_page<F>(page: &Arc<PageDesc>, fill: F) -> Frame
where
    F: FnOnce(Frame),
{
    debug_assert!(page.vaddr().is_user());

    let allocation = allocation_lock();
    allocation.acquire();

    let frame = match physmem::allocate() {
        Some(frame) => frame,
        None => {
            evict_one();

            // Eviction freed exactly one frame, and the
            // allocation lock keeps it ours.
            physmem::allocate().expect("no frame available after eviction")
        }
    };

    fill(frame);

    let current = thread::current();
    let pagedir = current
        .process()
        .and_then(|p| p.pagedir())
        .expect("user page requested by a thread with no address space");
    if !pagedir.set_page(page.vaddr(), frame, page.writable()) {
        panic!("user page {:p} is already mapped", page.vaddr());
    }

    let table = table_lock();
    table.acquire();
    lock!(FRAMES).insert(
        frame.index(),
        FrameEntry {
            frame,
            owner: current.tid(),
            page: page.clone(),
            unused_count: 0,
        },
    );
    table.release();

    page.with_state(|state| state.kind.insert(PageKind::IN_MEMORY));

    allocation.release();

    frame
}

// Releases the frame backing a page: clears the in-memory
// bit, unmaps the page from the owner's page directory,
// removes the table entry, and returns the frame to the pool.
//
pub(crate) fn free_user_page(frame: Frame, have_allocation_lock: bool) {
    let allocation = allocation_lock();
    if !have_allocation_lock {
        allocation.acquire();
    }

    let table = table_lock();
    table.acquire();
    let entry = lock!(FRAMES)
        .remove(&frame.index())
        .expect("freed frame missing from the frame table");
    table.release();

    entry.page.with_state(|state| state.kind.remove(PageKind::IN_MEMORY));

    let owner = thread::lookup(entry.owner).expect("frame table names a dead thread");
    let pagedir = owner
        .process()
        .and_then(|p| p.pagedir())
        .expect("frame table names a thread with no address space");
    pagedir.clear_page(entry.page.vaddr());

    physmem::free(frame);

    if !have_allocation_lock {
        allocation.release();
    }
}

// Evicts exactly one frame, freeing it back to the pool. The
// caller must hold the allocation lock.
//
fn evict_one() {
    let victim = choose_eviction_frame();
    debug!("evicting frame {}", victim.index());
    save_frame(victim);
    free_user_page(victim, true);
}

// Chooses the frame to evict: one full sweep of the table,
// clearing accessed bits as it goes, picking the largest
// unused count among eligible frames. Read-only file-backed
// frames are never chosen. Clean frames win ties with dirty
// ones.
//
fn choose_eviction_frame() -> Frame {
    let table = table_lock();
    table.acquire();

    let mut best: Option<(usize, i64, bool)> = None;
    let mut frames = lock!(FRAMES);
    for (index, entry) in frames.iter_mut() {
        let owner = thread::lookup(entry.owner).expect("frame table names a dead thread");
        let pagedir = owner
            .process()
            .and_then(|p| p.pagedir())
            .expect("frame table names a thread with no address space");
        let upage = entry.page.vaddr();

        let accessed = pagedir.is_accessed(upage);
        let dirty = pagedir.is_dirty(upage);
        if accessed {
            // Second chance: strip the accessed bit and let
            // the frame age from zero.
            pagedir.clear_accessed(upage);
            entry.unused_count = 0;
        } else {
            entry.unused_count += 1;
        }

        let eligible = entry.page.with_state(|state| {
            !(state.kind.contains(PageKind::FILESYS) && !state.writable)
        });
        if !eligible {
            continue;
        }

        let better = match best {
            None => true,
            Some((_, best_unused, best_dirty)) => {
                entry.unused_count > best_unused
                    || (entry.unused_count == best_unused && best_dirty && !dirty)
            }
        };
        if better {
            best = Some((*index, entry.unused_count, dirty));
        }
    }

    let (index, _, _) = best.expect("no evictable frame in the frame table");
    let entry = frames.get_mut(&index).expect("chosen frame disappeared");
    entry.unused_count = 0;
    let victim = entry.frame;

    drop(frames);
    table.release();

    victim
}

// Writes a victim frame's contents to their backing store:
// dirty memory-mapped pages go back to their file, anonymous
// and writable file-backed pages go to a fresh swap slot, and
// clean read-only file pages are simply dropped.
//
fn save_frame(frame: Frame) {
    let (owner, page) = {
        let frames = lock!(FRAMES);
        let entry = frames.get(&frame.index()).expect("victim frame missing from the frame table");
        (entry.owner, entry.page.clone())
    };

    let owner = thread::lookup(owner).expect("frame table names a dead thread");
    let pagedir = owner
        .process()
        .and_then(|p| p.pagedir())
        .expect("frame table names a thread with no address space");
    let dirty = pagedir.is_dirty(page.vaddr());

    enum Plan {
        Discard,
        WriteBack { mapid: i32, offset: usize, length: usize },
        SwapOut,
    }

    let plan = page.with_state(|state| {
        if state.kind.contains(PageKind::MMAP) {
            match (&state.backing, dirty) {
                (Backing::Mmap { mapid, offset, length }, true) => Plan::WriteBack {
                    mapid: *mapid,
                    offset: *offset,
                    length: *length,
                },
                _ => Plan::Discard,
            }
        } else if !state.kind.contains(PageKind::FILESYS) || state.writable {
            Plan::SwapOut
        } else {
            Plan::Discard
        }
    });

    match plan {
        Plan::Discard => {}
        Plan::WriteBack { mapid, offset, length } => {
            let process = owner.process().expect("mmap frame owned by a thread with no process");
            let file = process
                .mapping_file(mapid)
                .expect("mmap frame names a missing mapping");

            let mut buf = vec![0u8; length];
            physmem::read(frame, 0, &mut buf);
            fs::with_file_system(|| file.write_at(offset, &buf));
        }
        Plan::SwapOut => {
            let slot = match swap::alloc() {
                Some(slot) => slot,
                None => panic!("swap exhausted while evicting frame {}", frame.index()),
            };

            swap::save(slot, frame);
            page.with_state(|state| {
                state.kind.remove(PageKind::ZERO | PageKind::FILESYS | PageKind::IN_MEMORY);
                state.kind.insert(PageKind::SWAP);
                state.backing = Backing::Swap(slot);
            });
        }
    }
}

/// Checks the frame-table half of the memory invariant: every
/// entry's page has IN_MEMORY set, is not marked swapped, and
/// the owner's page directory maps it to this frame. A
/// violation is a kernel bug and panics.
///
pub fn check_invariants() {
    interrupts::without_interrupts(|| {
        for (index, entry) in lock!(FRAMES).iter() {
            let kind = entry.page.kind();
            assert!(kind.contains(PageKind::IN_MEMORY), "frame table entry for a non-resident page");
            assert!(!kind.contains(PageKind::SWAP), "frame table entry for a swapped page");

            let owner = thread::lookup(entry.owner).expect("frame table names a dead thread");
            let mapped = owner
                .process()
                .and_then(|p| p.pagedir())
                .and_then(|pd| pd.lookup(entry.page.vaddr()))
                .map(|(frame, _)| frame.index());
            assert_eq!(mapped, Some(*index), "page directory does not map the frame's page");
        }
    });
}
