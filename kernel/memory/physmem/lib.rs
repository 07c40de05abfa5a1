// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the pool of physical frames backing user virtual
//! memory.
//!
//! The pool holds a fixed arena of page-sized frames, chosen
//! when the machine boots. Allocation state is tracked with a
//! [`Bitmap`]: a set bit means the frame is free. When the pool
//! is exhausted, [`allocate`] returns `None` and the frame
//! allocator in the kernel crate must evict a frame before it
//! retries.
//!
//! Frame contents are read and written through [`read`] and
//! [`write`], which stand in for access through the kernel's
//! direct physical mapping.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use bitmap_index::Bitmap;
use log::debug;
use memlayout::PGSIZE;
use spin::{lock, Mutex};

/// Identifies a physical frame in the user pool.
///
/// A `Frame` doubles as the frame's kernel virtual address: the
/// kernel maps the whole pool contiguously, so the frame index
/// identifies the mapping uniquely.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Frame(usize);

impl Frame {
    /// Returns the frame's index in the user pool.
    ///
    pub const fn index(self) -> usize {
        self.0
    }
}

// A single contiguous pool of page-sized frames, tracked by a
// bitmap. A set bit means the frame is free.
//
struct Pool {
    free_frames: usize,
    bitmap: Bitmap,
    frames: Vec<[u8; PGSIZE]>,
}

static POOL: Mutex<Option<Pool>> = Mutex::new(None);

/// Initialises the user frame pool with `num_frames` frames.
///
/// Any previous pool is discarded, so tests can reboot the
/// machine with a different amount of memory.
///
pub fn init(num_frames: usize) {
    debug!("user frame pool: {} frames ({} KiB)", num_frames, (num_frames * PGSIZE) / 1024);
    *lock!(POOL) = Some(Pool {
        free_frames: num_frames,
        bitmap: Bitmap::new_set(num_frames),
        frames: vec![[0u8; PGSIZE]; num_frames],
    });
}

/// Allocates a frame from the user pool, or returns `None` if
/// the pool is exhausted.
///
/// The returned frame is zero-filled, so a process can never
/// observe another process's stale memory.
///
/// # Panics
///
/// `allocate` panics if the pool has not been initialised.
///
pub fn allocate() -> Option<Frame> {
    let mut guard = lock!(POOL);
    let pool = guard.as_mut().expect("user frame pool not initialised");
    let index = pool.bitmap.next_set()?;
    pool.bitmap.unset(index);
    pool.free_frames -= 1;
    pool.frames[index] = [0u8; PGSIZE];

    Some(Frame(index))
}

/// Returns a frame to the user pool.
///
/// # Panics
///
/// `free` panics if the frame is not currently allocated, as
/// a double free indicates a kernel bug.
///
pub fn free(frame: Frame) {
    let mut guard = lock!(POOL);
    let pool = guard.as_mut().expect("user frame pool not initialised");
    if pool.bitmap.get(frame.0) {
        panic!("frame {} freed while already free", frame.0);
    }

    pool.bitmap.set(frame.0);
    pool.free_frames += 1;
}

/// Returns the number of free frames in the pool.
///
/// # Panics
///
/// `num_free` panics if the pool has not been initialised.
///
pub fn num_free() -> usize {
    let guard = lock!(POOL);
    guard.as_ref().expect("user frame pool not initialised").free_frames
}

/// Copies bytes out of a frame, starting at `offset`.
///
/// # Panics
///
/// `read` panics if the range extends past the end of the
/// frame or the frame is not allocated.
///
pub fn read(frame: Frame, offset: usize, buf: &mut [u8]) {
    let guard = lock!(POOL);
    let pool = guard.as_ref().expect("user frame pool not initialised");
    check_access(pool, frame, offset, buf.len());
    buf.copy_from_slice(&pool.frames[frame.0][offset..offset + buf.len()]);
}

/// Copies bytes into a frame, starting at `offset`.
///
/// # Panics
///
/// `write` panics if the range extends past the end of the
/// frame or the frame is not allocated.
///
pub fn write(frame: Frame, offset: usize, buf: &[u8]) {
    let mut guard = lock!(POOL);
    let pool = guard.as_mut().expect("user frame pool not initialised");
    check_access(pool, frame, offset, buf.len());
    pool.frames[frame.0][offset..offset + buf.len()].copy_from_slice(buf);
}

/// Zeroes the byte range of a frame starting at `offset`.
///
/// # Panics
///
/// `zero` panics if the range extends past the end of the
/// frame or the frame is not allocated.
///
pub fn zero(frame: Frame, offset: usize, len: usize) {
    let mut guard = lock!(POOL);
    let pool = guard.as_mut().expect("user frame pool not initialised");
    check_access(pool, frame, offset, len);
    for byte in pool.frames[frame.0][offset..offset + len].iter_mut() {
        *byte = 0;
    }
}

fn check_access(pool: &Pool, frame: Frame, offset: usize, len: usize) {
    if frame.0 >= pool.frames.len() {
        panic!("access to frame {} outside pool of {}", frame.0, pool.frames.len());
    }

    if pool.bitmap.get(frame.0) {
        panic!("access to unallocated frame {}", frame.0);
    }

    if offset + len > PGSIZE {
        panic!("access to frame {} spills past the page: offset {}, len {}", frame.0, offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool() {
        init(3);
        assert_eq!(num_free(), 3);

        let a = allocate().unwrap();
        let b = allocate().unwrap();
        let c = allocate().unwrap();
        assert_eq!(num_free(), 0);
        assert_eq!(allocate(), None);

        // Contents survive round trips and frames are
        // zeroed when reallocated.
        write(b, 100, b"petrel");
        let mut buf = [0u8; 6];
        read(b, 100, &mut buf);
        assert_eq!(&buf, b"petrel");

        free(b);
        assert_eq!(num_free(), 1);
        let b2 = allocate().unwrap();
        read(b2, 100, &mut buf);
        assert_eq!(&buf, &[0u8; 6]);

        free(a);
        free(b2);
        free(c);
        assert_eq!(num_free(), 3);
    }
}
