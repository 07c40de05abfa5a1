// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a spinlock, which will panic if it appears to
//! be deadlocked.
//!
//! This lock protects short-lived kernel data structures, so a
//! thread that fails to take it after an enormous number of
//! attempts has almost certainly deadlocked. Panicking at that
//! point gives a far better diagnostic than hanging silently.

#![no_std]
#![deny(clippy::wildcard_imports)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::panic::Location;
use core::sync::atomic::{AtomicBool, Ordering};
use core::{fmt, hint};

/// The maximum number of times a mutex can be polled before the
/// lock attempt is declared a deadlock and the kernel panics.
///
pub const MAX_LOCK_ATTEMPTS: usize = 100_000_000;

/// A spinlock providing mutually-exclusive access to data.
///
pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    /// Returns a new unlocked mutex containing `data`.
    ///
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Mutex {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Returns whether the mutex is currently locked.
    ///
    /// There is no synchronisation of the return value, so it
    /// can become stale immediately. Use it only as a hint.
    ///
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Attempts to lock the mutex without spinning.
    ///
    #[inline(always)]
    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard {
                locked: &self.locked,
                data: unsafe { &mut *self.data.get() },
            })
        } else {
            None
        }
    }

    /// Locks the mutex, spinning until it becomes available.
    ///
    /// Prefer the [`lock!`] macro, which records the caller's
    /// location in the panic message if the lock appears to be
    /// deadlocked.
    ///
    /// # Panics
    ///
    /// `lock` panics after [`MAX_LOCK_ATTEMPTS`] failed polls,
    /// on the basis that the lock must be deadlocked.
    ///
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<T> {
        let caller = Location::caller();
        let mut attempts = 0_usize;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            while self.is_locked() {
                attempts += 1;
                if attempts > MAX_LOCK_ATTEMPTS {
                    panic!("DEADLOCK: failed to lock mutex at {}", caller);
                }

                hint::spin_loop();
            }
        }
    }
}

/// Locks the mutex, returning a mutex guard, which will unlock
/// the mutex once dropped.
///
#[macro_export]
macro_rules! lock {
    ($mutex:expr) => {
        $mutex.lock()
    };
}

/// The mutex guard, which allows mutable access to the locked
/// data.
///
/// When the guard is dropped, the lock is released.
///
pub struct MutexGuard<'lock, T: ?Sized + 'lock> {
    locked: &'lock AtomicBool,
    data: &'lock mut T,
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Mutex {{ data: {:?} }}", &*guard),
            None => write!(f, "Mutex {{ <locked> }}"),
        }
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<'lock, T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'lock, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'lock, T: ?Sized> Deref for MutexGuard<'lock, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'lock, T: ?Sized> DerefMut for MutexGuard<'lock, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'lock, T: ?Sized> Drop for MutexGuard<'lock, T> {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex() {
        let mutex = Mutex::new(7_usize);
        {
            let mut guard = lock!(mutex);
            assert_eq!(*guard, 7);
            *guard += 1;
            assert!(mutex.is_locked());
            assert!(mutex.try_lock().is_none());
        }

        assert!(!mutex.is_locked());
        assert_eq!(*lock!(mutex), 8);
    }
}
