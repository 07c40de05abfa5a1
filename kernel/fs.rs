// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Serialises access to the filesystem.
//!
//! The filesystem is not internally thread-safe at the level
//! the kernel needs, so every call into it happens under one
//! global lock. Callers must copy user data into kernel
//! buffers *before* taking the lock: a page fault taken while
//! holding it would have to wait for eviction write-back,
//! which itself needs the lock.

use crate::multitasking::sync::Lock;
use lazy_static::lazy_static;
use spin::{lock, Mutex};

lazy_static! {
    static ref FS_LOCK: Mutex<Option<Lock>> = Mutex::new(None);
}

pub(crate) fn init() {
    *lock!(FS_LOCK) = Some(Lock::new());
}

fn fs_lock() -> Lock {
    lock!(FS_LOCK).clone().expect("filesystem lock not initialised")
}

/// Takes the global filesystem lock.
///
pub fn start_file_system_access() {
    fs_lock().acquire();
}

/// Releases the global filesystem lock.
///
pub fn end_file_system_access() {
    fs_lock().release();
}

/// Runs `f` under the global filesystem lock.
///
pub fn with_file_system<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let guard = fs_lock();
    guard.acquire();
    let result = f();
    guard.release();

    result
}
