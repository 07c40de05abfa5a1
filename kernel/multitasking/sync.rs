// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the kernel's synchronisation primitives: the
//! semaphore, the lock with priority donation, and the
//! condition variable.
//!
//! In priority mode a lock donates the effective priority of
//! its highest waiter to its holder, and the donation cascades
//! along the chain of blocked holders. The donation never
//! mutates a thread's base priority: each lock caches the
//! highest priority waiting on it, and a thread's effective
//! priority is computed from the locks it holds. In MLFQ mode
//! donation is disabled; priorities are recomputed instead.
//!
//! All three primitives disable interrupts around their
//! critical mutations, which is the only atomicity this
//! single-CPU machine needs.

use super::scheduler;
use super::thread::{self, Status, Thread, Tid};
use crate::interrupts;
use std::cell::UnsafeCell;
use std::sync::Arc;

// The donation cache value of a lock no thread is waiting on.
//
const NO_DONATION: i32 = i32::MIN;

/// A counting semaphore.
///
/// `down` blocks while the count is zero; `up` increments the
/// count and wakes the highest-priority waiter, with ties
/// broken in FIFO order.
///
pub struct Semaphore {
    value: UnsafeCell<usize>,
    waiters: UnsafeCell<Vec<Tid>>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Returns a new semaphore with the given initial count.
    ///
    pub fn new(value: usize) -> Self {
        Semaphore {
            value: UnsafeCell::new(value),
            waiters: UnsafeCell::new(Vec::new()),
        }
    }

    /// Decrements the count, blocking until it is positive.
    ///
    /// # Panics
    ///
    /// `down` panics if called from interrupt context, which
    /// must never block.
    ///
    pub fn down(&self) {
        assert!(!interrupts::in_interrupt(), "semaphore down in interrupt context");

        let enabled = interrupts::disable();
        let current = thread::current();
        while unsafe { *self.value.get() } == 0 {
            self.insert_waiter(&current);
            scheduler::block();
        }

        unsafe { *self.value.get() -= 1 };
        interrupts::set_level(enabled);
    }

    /// Increments the count and unblocks the highest-priority
    /// waiter, if any.
    ///
    /// Safe to call from interrupt context: if the woken
    /// thread should preempt, the handler yields on return
    /// rather than blocking.
    ///
    pub fn up(&self) {
        let enabled = interrupts::disable();
        unsafe { *self.value.get() += 1 };
        if let Some(tid) = self.pop_waiter() {
            let thread = thread::lookup(tid).expect("semaphore waiter disappeared");
            debug_assert_eq!(thread.status(), Status::Blocked);
            scheduler::enqueue(&thread);
        }

        interrupts::set_level(enabled);
    }

    // Inserts the thread into the waiter list, before the
    // first waiter with a strictly lower effective priority.
    // Interrupts must be disabled.
    //
    fn insert_waiter(&self, thread: &Arc<Thread>) {
        let waiters = unsafe { &mut *self.waiters.get() };
        let priority = thread.effective_priority();
        let at = waiters
            .iter()
            .position(|tid| waiter_priority(*tid) < priority)
            .unwrap_or(waiters.len());
        waiters.insert(at, thread.tid());
    }

    // Pops the highest-priority waiter. Interrupts must be
    // disabled.
    //
    fn pop_waiter(&self) -> Option<Tid> {
        let waiters = unsafe { &mut *self.waiters.get() };
        if waiters.is_empty() {
            None
        } else {
            Some(waiters.remove(0))
        }
    }

    // Re-inserts a waiter whose effective priority changed
    // through donation. Interrupts must be disabled.
    //
    fn reposition_waiter(&self, thread: &Arc<Thread>) {
        let waiters = unsafe { &mut *self.waiters.get() };
        waiters.retain(|tid| *tid != thread.tid());
        self.insert_waiter(thread);
    }

    // The highest effective priority among the waiters, or
    // NO_DONATION if there are none. Interrupts must be
    // disabled.
    //
    fn max_waiter_priority(&self) -> i32 {
        let waiters = unsafe { &*self.waiters.get() };
        waiters.iter().map(|tid| waiter_priority(*tid)).max().unwrap_or(NO_DONATION)
    }
}

fn waiter_priority(tid: Tid) -> i32 {
    thread::lookup(tid).map(|t| t.effective_priority()).unwrap_or(NO_DONATION)
}

// The shared state of a lock. Reached through the cheap `Lock`
// handle so that a thread's held-lock list and blocker field
// can refer to the same lock.
//
struct LockInner {
    sema: Semaphore,
    holder: UnsafeCell<Option<Tid>>,
    donated: UnsafeCell<i32>,
}

unsafe impl Send for LockInner {}
unsafe impl Sync for LockInner {}

/// A mutual-exclusion lock with priority donation.
///
/// A lock is not reentrant: acquiring a lock the current
/// thread already holds is a kernel bug and panics.
///
/// `Lock` is a cheap handle; clones refer to the same lock.
///
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// Returns a new, unheld lock.
    ///
    pub fn new() -> Self {
        Lock {
            inner: Arc::new(LockInner {
                sema: Semaphore::new(1),
                holder: UnsafeCell::new(None),
                donated: UnsafeCell::new(NO_DONATION),
            }),
        }
    }

    /// Returns whether the two handles refer to the same lock.
    ///
    pub fn is_same(&self, other: &Lock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the id of the thread holding the lock, if any.
    ///
    pub fn holder(&self) -> Option<Tid> {
        interrupts::without_interrupts(|| unsafe { *self.inner.holder.get() })
    }

    // The cached highest priority waiting on this lock, used
    // both for donation to the holder and for ordering the
    // holder's held-lock list.
    //
    pub(crate) fn donated_priority(&self) -> i32 {
        unsafe { *self.inner.donated.get() }
    }

    fn set_donated_priority(&self, priority: i32) {
        unsafe { *self.inner.donated.get() = priority };
    }

    fn holder_thread(&self) -> Option<Arc<Thread>> {
        let tid = unsafe { *self.inner.holder.get() }?;
        thread::lookup(tid)
    }

    /// Returns whether the current thread holds this lock.
    ///
    pub fn held_by_current_thread(&self) -> bool {
        self.holder() == Some(thread::current_tid())
    }

    /// Acquires the lock, blocking until it is available.
    ///
    /// In priority mode, a blocked acquirer donates its
    /// effective priority to the holder, cascading along the
    /// chain of blocked holders.
    ///
    /// # Panics
    ///
    /// `acquire` panics if called from interrupt context or if
    /// the current thread already holds the lock.
    ///
    pub fn acquire(&self) {
        assert!(!interrupts::in_interrupt(), "lock acquire in interrupt context");

        let enabled = interrupts::disable();
        let current = thread::current();
        assert!(
            unsafe { *self.inner.holder.get() } != Some(current.tid()),
            "lock acquired twice by thread {}",
            current.name()
        );

        if !scheduler::mlfqs_enabled() && self.holder_thread().is_some() {
            current.set_blocker(Some(self.clone()));
            self.donate(current.effective_priority());
        }

        self.inner.sema.down();

        // The lock is ours.
        current.set_blocker(None);
        unsafe { *self.inner.holder.get() = Some(current.tid()) };
        if !scheduler::mlfqs_enabled() {
            self.set_donated_priority(self.inner.sema.max_waiter_priority());
            current.push_held_lock(self.clone());
        }

        interrupts::set_level(enabled);
    }

    // Donates `priority` to this lock's holder, cascading
    // iteratively while the holder is itself blocked on a
    // lock whose donation the new priority raises. The chain
    // is finite because the hold graph is acyclic in a
    // correct program. Interrupts must be disabled.
    //
    fn donate(&self, priority: i32) {
        let mut lock = self.clone();
        let mut priority = priority;

        loop {
            if priority <= lock.donated_priority() {
                return;
            }

            lock.set_donated_priority(priority);

            let holder = match lock.holder_thread() {
                Some(holder) => holder,
                None => return,
            };

            // The lock's standing among the holder's held
            // locks may have risen.
            holder.resort_held_lock(&lock);

            match holder.status() {
                Status::Ready => {
                    // A ready holder may now outrank threads
                    // queued ahead of it.
                    scheduler::reposition_ready(&holder);
                    return;
                }
                Status::Blocked => match holder.blocker() {
                    Some(blocked_on) => {
                        let raised = holder.effective_priority();
                        blocked_on.inner.sema.reposition_waiter(&holder);
                        lock = blocked_on;
                        priority = raised;
                    }
                    None => return,
                },
                _ => return,
            }
        }
    }

    /// Releases the lock and wakes the highest-priority
    /// waiter. If the woken thread's effective priority
    /// exceeds the releaser's, the releaser yields.
    ///
    /// # Panics
    ///
    /// `release` panics unless the current thread holds the
    /// lock.
    ///
    pub fn release(&self) {
        let enabled = interrupts::disable();
        let current = thread::current();
        assert!(
            unsafe { *self.inner.holder.get() } == Some(current.tid()),
            "lock released by thread {} which does not hold it",
            current.name()
        );

        unsafe { *self.inner.holder.get() = None };
        if !scheduler::mlfqs_enabled() {
            // Dropping the lock drops its donation with it.
            current.remove_held_lock(self);
        }

        unsafe { *self.inner.sema.value.get() += 1 };
        let woken = self.inner.sema.pop_waiter();
        if !scheduler::mlfqs_enabled() {
            self.set_donated_priority(self.inner.sema.max_waiter_priority());
        }

        if let Some(tid) = woken {
            let thread = thread::lookup(tid).expect("lock waiter disappeared");
            debug_assert_eq!(thread.status(), Status::Blocked);
            scheduler::enqueue(&thread);
        }

        interrupts::set_level(enabled);
    }
}

// The state of one condition variable: the semaphores of the
// threads currently waiting on it, in arrival order.
//
struct CondvarInner {
    waiters: UnsafeCell<Vec<Arc<Semaphore>>>,
}

unsafe impl Send for CondvarInner {}
unsafe impl Sync for CondvarInner {}

/// A condition variable, for waiting on a condition protected
/// by a monitor lock.
///
/// `Condvar` is a cheap handle; clones refer to the same
/// condition variable.
///
#[derive(Clone)]
pub struct Condvar {
    inner: Arc<CondvarInner>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    /// Returns a new condition variable.
    ///
    pub fn new() -> Self {
        Condvar {
            inner: Arc::new(CondvarInner {
                waiters: UnsafeCell::new(Vec::new()),
            }),
        }
    }

    /// Atomically releases the monitor lock and waits to be
    /// signalled, then re-acquires the lock before returning.
    ///
    /// # Panics
    ///
    /// `wait` panics if called from interrupt context or if
    /// the current thread does not hold the monitor lock.
    ///
    pub fn wait(&self, monitor: &Lock) {
        assert!(!interrupts::in_interrupt(), "condvar wait in interrupt context");
        assert!(monitor.held_by_current_thread(), "condvar wait without the monitor lock");

        // Each waiter gets its own single-use semaphore, so a
        // signaller can wake exactly one thread.
        let waiter = Arc::new(Semaphore::new(0));
        interrupts::without_interrupts(|| {
            let waiters = unsafe { &mut *self.inner.waiters.get() };
            waiters.push(waiter.clone());
        });

        monitor.release();
        waiter.down();
        monitor.acquire();
    }

    /// Wakes the longest-waiting thread, if any.
    ///
    /// # Panics
    ///
    /// `signal` panics if the current thread does not hold the
    /// monitor lock.
    ///
    pub fn signal(&self, monitor: &Lock) {
        assert!(monitor.held_by_current_thread(), "condvar signal without the monitor lock");

        let waiter = interrupts::without_interrupts(|| {
            let waiters = unsafe { &mut *self.inner.waiters.get() };
            if waiters.is_empty() {
                None
            } else {
                Some(waiters.remove(0))
            }
        });

        if let Some(waiter) = waiter {
            waiter.up();
        }
    }

    /// Wakes every waiting thread.
    ///
    /// # Panics
    ///
    /// `broadcast` panics if the current thread does not hold
    /// the monitor lock.
    ///
    pub fn broadcast(&self, monitor: &Lock) {
        assert!(monitor.held_by_current_thread(), "condvar broadcast without the monitor lock");

        let waiters = interrupts::without_interrupts(|| {
            let waiters = unsafe { &mut *self.inner.waiters.get() };
            std::mem::take(waiters)
        });

        for waiter in waiters {
            waiter.up();
        }
    }
}
