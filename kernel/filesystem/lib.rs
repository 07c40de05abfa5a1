// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the logical design of the filesystem the kernel
//! core consumes.
//!
//! This crate does not implement an on-disk filesystem. It
//! provides the flat, fixed-size-file interface the process
//! layer and the virtual memory system are written against —
//! named files that can be created, removed and opened, and
//! open-file handles with independent positions — backed by an
//! in-memory store seeded at boot.
//!
//! Files have the semantics the syscall layer relies on:
//!
//! - a file's length is fixed when it is created; writes past
//!   the end are truncated, never extended.
//! - removing a file unlinks its name, but handles that are
//!   already open keep working until they are dropped.
//! - writes can be denied per inode while an executable is
//!   running, and re-allowed afterwards.
//!
//! The caller is responsible for serialising access with the
//! kernel's global filesystem lock; this crate only protects
//! its own internal consistency.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::debug;
use spin::{lock, Mutex};

// The file name registry, mapping each name to its inode.
//
static REGISTRY: Mutex<Option<BTreeMap<String, Arc<Inode>>>> = Mutex::new(None);

/// Initialises the filesystem with an empty root directory.
///
/// Any previous contents are discarded, so tests can reboot
/// the machine with a fresh disk.
///
pub fn init() {
    *lock!(REGISTRY) = Some(BTreeMap::new());
}

/// Creates a zero-filled file of the given size.
///
/// Returns false if a file with this name already exists or
/// the filesystem has not been initialised.
///
pub fn create(name: &str, size: usize) -> bool {
    let mut guard = lock!(REGISTRY);
    let registry = match guard.as_mut() {
        Some(registry) => registry,
        None => return false,
    };

    if registry.contains_key(name) {
        return false;
    }

    registry.insert(String::from(name), Arc::new(Inode::new(vec![0u8; size])));

    true
}

/// Creates a file with the given contents, replacing any file
/// with the same name.
///
/// This is how the boot sequence seeds the disk with the
/// executables extracted from the boot archive.
///
pub fn install(name: &str, contents: &[u8]) {
    debug!("filesystem: installing {} ({} bytes)", name, contents.len());
    let mut guard = lock!(REGISTRY);
    let registry = guard.as_mut().expect("filesystem not initialised");
    registry.insert(String::from(name), Arc::new(Inode::new(contents.to_vec())));
}

/// Removes the file with the given name.
///
/// The name is unlinked immediately; handles that are already
/// open remain usable until they are dropped.
///
pub fn remove(name: &str) -> bool {
    let mut guard = lock!(REGISTRY);
    let registry = match guard.as_mut() {
        Some(registry) => registry,
        None => return false,
    };

    registry.remove(name).is_some()
}

/// Opens the file with the given name.
///
/// Each call returns an independent handle with its own file
/// position.
///
pub fn open(name: &str) -> Option<File> {
    let guard = lock!(REGISTRY);
    let inode = guard.as_ref()?.get(name)?.clone();

    Some(File {
        inode,
        pos: Arc::new(Mutex::new(0)),
        denied: Arc::new(Mutex::new(false)),
    })
}

// The backing store for one file.
//
struct Inode {
    data: Mutex<Vec<u8>>,
    deny_writes: AtomicUsize,
}

impl Inode {
    fn new(data: Vec<u8>) -> Self {
        Inode {
            data: Mutex::new(data),
            deny_writes: AtomicUsize::new(0),
        }
    }
}

/// An open file handle.
///
/// Cloning a handle shares the position, which mirrors how the
/// file-descriptor table and the supplemental page table can
/// refer to the same open file.
///
#[derive(Clone)]
pub struct File {
    inode: Arc<Inode>,
    pos: Arc<Mutex<usize>>,
    denied: Arc<Mutex<bool>>,
}

impl File {
    /// Returns the file's length in bytes.
    ///
    pub fn length(&self) -> usize {
        lock!(self.inode.data).len()
    }

    /// Returns the current file position.
    ///
    pub fn tell(&self) -> usize {
        *lock!(self.pos)
    }

    /// Moves the file position to `pos`.
    ///
    /// Positions past the end of the file are allowed; reads
    /// there return zero bytes.
    ///
    pub fn seek(&self, pos: usize) {
        *lock!(self.pos) = pos;
    }

    /// Reads from the current position, advancing it. Returns
    /// the number of bytes read, which is short at end of file.
    ///
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = lock!(self.pos);
        let n = self.read_at(*pos, buf);
        *pos += n;

        n
    }

    /// Writes at the current position, advancing it. Returns
    /// the number of bytes written, which is short if the
    /// write runs past the fixed end of the file or writes to
    /// the file are currently denied.
    ///
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = lock!(self.pos);
        let n = self.write_at(*pos, buf);
        *pos += n;

        n
    }

    /// Reads from the given offset without touching the file
    /// position.
    ///
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = lock!(self.inode.data);
        if offset >= data.len() {
            return 0;
        }

        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);

        n
    }

    /// Writes at the given offset without touching the file
    /// position.
    ///
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if self.inode.deny_writes.load(Ordering::Acquire) > 0 {
            return 0;
        }

        let mut data = lock!(self.inode.data);
        if offset >= data.len() {
            return 0;
        }

        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);

        n
    }

    /// Prevents writes to the file's inode until a matching
    /// [`allow_write`](File::allow_write).
    ///
    /// Denying twice through the same handle has no further
    /// effect.
    ///
    pub fn deny_write(&self) {
        let mut denied = lock!(self.denied);
        if !*denied {
            *denied = true;
            self.inode.deny_writes.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Re-allows writes denied through this handle.
    ///
    pub fn allow_write(&self) {
        let mut denied = lock!(self.denied);
        if *denied {
            *denied = false;
            self.inode.deny_writes.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Returns whether the two handles refer to the same
    /// underlying file.
    ///
    pub fn same_inode(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.inode, &other.inode)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // The last handle from a deny_write caller balances
        // the denial so the inode does not stay locked after
        // the process exits.
        if Arc::strong_count(&self.denied) == 1 {
            self.allow_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is global state, so the checks run in a
    // single test body.
    #[test]
    fn filesystem() {
        create_open_remove();
        read_write();
        deny_write();
        deny_write_released_on_drop();
    }

    fn create_open_remove() {
        init();
        assert!(create("alpha", 16));
        assert!(!create("alpha", 16));

        let file = open("alpha").expect("open failed");
        assert_eq!(file.length(), 16);
        assert!(open("beta").is_none());

        // Unlinking leaves the open handle usable.
        assert!(remove("alpha"));
        assert!(!remove("alpha"));
        assert_eq!(file.length(), 16);
        assert!(open("alpha").is_none());
    }

    fn read_write() {
        init();
        install("data", b"0123456789");

        let file = open("data").expect("open failed");
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(file.tell(), 4);

        assert_eq!(file.write(b"abcd"), 4);
        assert_eq!(file.tell(), 8);
        file.seek(4);
        assert_eq!(file.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");

        // Writes never extend the file.
        file.seek(8);
        assert_eq!(file.write(b"xyz"), 2);
        assert_eq!(file.length(), 10);

        // Reads past the end return nothing.
        assert_eq!(file.read_at(10, &mut buf), 0);
    }

    fn deny_write() {
        init();
        install("prog", b"machine code");

        let executing = open("prog").expect("open failed");
        let other = open("prog").expect("open failed");

        executing.deny_write();
        executing.deny_write();
        assert_eq!(other.write_at(0, b"overwrite"), 0);

        executing.allow_write();
        assert_eq!(other.write_at(0, b"ok"), 2);
    }

    fn deny_write_released_on_drop() {
        init();
        install("prog", b"machine code");

        let executing = open("prog").expect("open failed");
        executing.deny_write();
        drop(executing);

        let other = open("prog").expect("open failed");
        assert_eq!(other.write_at(0, b"ok"), 2);
    }
}
