// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the swap device interface.
//!
//! Swap is divided into page-sized slots on a backing block
//! store; a bitmap tracks which slots are free. An evicted
//! page owns exactly one slot until it is faulted back in,
//! when the slot is released.

use bitmap_index::Bitmap;
use memlayout::PGSIZE;
use physmem::Frame;
use spin::{lock, Mutex};

/// Identifies one page-sized slot on the swap device.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Slot(usize);

struct Device {
    // A set bit marks a free slot.
    bitmap: Bitmap,
    slots: Vec<[u8; PGSIZE]>,
}

static SWAP: Mutex<Option<Device>> = Mutex::new(None);

/// Initialises the swap device with `num_slots` page-sized
/// slots. Any previous contents are discarded.
///
pub(crate) fn init(num_slots: usize) {
    *lock!(SWAP) = Some(Device {
        bitmap: Bitmap::new_set(num_slots),
        slots: vec![[0u8; PGSIZE]; num_slots],
    });
}

/// Reserves a free swap slot, or returns `None` if swap is
/// full.
///
pub(crate) fn alloc() -> Option<Slot> {
    let mut guard = lock!(SWAP);
    let device = guard.as_mut().expect("swap device not initialised");
    let index = device.bitmap.next_set()?;
    device.bitmap.unset(index);

    Some(Slot(index))
}

/// Releases a swap slot.
///
/// # Panics
///
/// `free` panics if the slot is already free, which indicates
/// a kernel bug.
///
pub(crate) fn free(slot: Slot) {
    let mut guard = lock!(SWAP);
    let device = guard.as_mut().expect("swap device not initialised");
    if device.bitmap.get(slot.0) {
        panic!("swap slot {} freed while already free", slot.0);
    }

    device.bitmap.set(slot.0);
}

/// Writes a frame's contents into a swap slot.
///
pub(crate) fn save(slot: Slot, frame: Frame) {
    let mut page = [0u8; PGSIZE];
    physmem::read(frame, 0, &mut page);

    let mut guard = lock!(SWAP);
    let device = guard.as_mut().expect("swap device not initialised");
    device.slots[slot.0] = page;
}

/// Reads a swap slot's contents into a frame.
///
pub(crate) fn load(slot: Slot, frame: Frame) {
    let page = {
        let guard = lock!(SWAP);
        let device = guard.as_ref().expect("swap device not initialised");
        device.slots[slot.0]
    };

    physmem::write(frame, 0, &page);
}

/// Returns the number of free swap slots.
///
pub fn num_free() -> usize {
    let guard = lock!(SWAP);
    guard.as_ref().expect("swap device not initialised").bitmap.num_set()
}
