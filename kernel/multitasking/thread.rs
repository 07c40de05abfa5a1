// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements threads and their control blocks.
//!
//! Each thread has a unique id, a short name, a scheduling
//! status and a priority in `[PRI_MIN, PRI_MAX]`. A thread's
//! *effective* priority can exceed its base priority while it
//! holds a lock that higher-priority threads are waiting on;
//! see [`sync`](super::sync) for the donation machinery.
//!
//! A control block carries a magic sentinel, the moral
//! equivalent of the canary at the base of a stack page:
//! [`current`] checks it on every call and panics if it has
//! been corrupted.

use super::sync::Lock;
use super::{scheduler, switch, CURRENT, IDLE, INITIAL, THREADS};
use crate::interrupts;
use crate::process::Process;
use fixedpoint::Fixed;
use lazy_static::lazy_static;
use log::error;
use spin::{lock, Mutex};
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The lowest thread priority.
///
pub const PRI_MIN: i32 = 0;

/// The default thread priority.
///
pub const PRI_DEFAULT: i32 = 31;

/// The highest thread priority.
///
pub const PRI_MAX: i32 = 63;

// The longest thread name, in bytes. Longer names are
// truncated.
//
const MAX_NAME_LEN: usize = 16;

// The sentinel stored in every control block. See the module
// docs.
//
const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

lazy_static! {
    // The monotonic thread id counter, behind its own small
    // lock.
    //
    static ref NEXT_TID: Mutex<i32> = Mutex::new(1);
}

/// Uniquely identifies a thread throughout the kernel.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tid(i32);

impl Tid {
    fn next() -> Self {
        let mut counter = lock!(NEXT_TID);
        let tid = Tid(*counter);
        *counter += 1;

        tid
    }

    /// Returns a numerical representation for the thread id.
    ///
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns the thread id with the given numerical value,
    /// as received from a user process.
    ///
    pub const fn from_i32(tid: i32) -> Self {
        Tid(tid)
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// The thread is on the ready queue, waiting for the CPU.
    Ready,

    /// The thread is executing on the CPU.
    Running,

    /// The thread is blocked on a synchronisation primitive.
    Blocked,

    /// The thread is on the sleep queue until its wakeup tick.
    Sleeping,

    /// The thread has exited and awaits destruction by the
    /// next thread to run.
    Dying,
}

/// Describes an error encountered while creating a thread.
///
#[derive(Debug, Eq, PartialEq)]
pub enum CreateError {
    /// The system could not allocate the resources backing the
    /// new thread.
    OutOfMemory,
}

/// Contains the metadata for a thread of execution.
///
/// The single-writer fields below are stored in `UnsafeCell`s
/// and are only accessed with interrupts disabled; the baton
/// discipline in [`switch`](super::switch) guarantees at most
/// one thread executes kernel code at a time, which makes that
/// sound on this single-CPU machine.
///
pub struct Thread {
    tid: Tid,
    name: String,
    magic: u32,

    status: UnsafeCell<Status>,
    priority: UnsafeCell<i32>,
    held_locks: UnsafeCell<Vec<Lock>>,
    blocker: UnsafeCell<Option<Lock>>,
    wakeup_tick: UnsafeCell<i64>,
    nice: UnsafeCell<i32>,
    recent_cpu: UnsafeCell<Fixed>,

    // The user process this thread runs, if any. Kernel
    // threads have no process.
    process: Mutex<Option<Arc<Process>>>,

    // This thread's children, created through exec. Holding
    // the child control blocks here keeps an exited child's
    // exit status readable until the parent has waited for it.
    children: Mutex<Vec<Arc<Thread>>>,

    // The thread that created this one through exec, if it is
    // still alive.
    parent: Mutex<Option<Tid>>,

    baton: switch::Baton,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(tid: Tid, name: &str, priority: i32, status: Status) -> Thread {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));

        let mut name = String::from(name);
        name.truncate(MAX_NAME_LEN);

        Thread {
            tid,
            name,
            magic: THREAD_MAGIC,
            status: UnsafeCell::new(status),
            priority: UnsafeCell::new(priority),
            held_locks: UnsafeCell::new(Vec::new()),
            blocker: UnsafeCell::new(None),
            wakeup_tick: UnsafeCell::new(0),
            nice: UnsafeCell::new(0),
            recent_cpu: UnsafeCell::new(Fixed::ZERO),
            process: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            parent: Mutex::new(None),
            baton: switch::Baton::new(),
        }
    }

    /// Returns the thread's unique id.
    ///
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Returns the thread's name, which is not guaranteed to
    /// be unique.
    ///
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn status(&self) -> Status {
        unsafe { *self.status.get() }
    }

    pub(crate) fn set_status(&self, status: Status) {
        unsafe { *self.status.get() = status };
    }

    // The thread's base priority (or its computed priority in
    // MLFQ mode).
    //
    pub(crate) fn base_priority(&self) -> i32 {
        unsafe { *self.priority.get() }
    }

    pub(crate) fn set_base_priority(&self, priority: i32) {
        unsafe { *self.priority.get() = priority };
    }

    /// Returns the priority the scheduler uses for this
    /// thread: the maximum of its base priority and the
    /// highest donation among the locks it holds.
    ///
    pub fn effective_priority(&self) -> i32 {
        if scheduler::mlfqs_enabled() {
            return self.base_priority();
        }

        let held = unsafe { &*self.held_locks.get() };
        match held.first() {
            Some(lock) => self.base_priority().max(lock.donated_priority()),
            None => self.base_priority(),
        }
    }

    pub(crate) fn blocker(&self) -> Option<Lock> {
        unsafe { (*self.blocker.get()).clone() }
    }

    pub(crate) fn set_blocker(&self, blocker: Option<Lock>) {
        unsafe { *self.blocker.get() = blocker };
    }

    pub(crate) fn wakeup_tick(&self) -> i64 {
        unsafe { *self.wakeup_tick.get() }
    }

    pub(crate) fn set_wakeup_tick(&self, tick: i64) {
        unsafe { *self.wakeup_tick.get() = tick };
    }

    pub(crate) fn nice(&self) -> i32 {
        unsafe { *self.nice.get() }
    }

    pub(crate) fn set_nice(&self, nice: i32) {
        unsafe { *self.nice.get() = nice };
    }

    pub(crate) fn recent_cpu(&self) -> Fixed {
        unsafe { *self.recent_cpu.get() }
    }

    pub(crate) fn set_recent_cpu(&self, recent_cpu: Fixed) {
        unsafe { *self.recent_cpu.get() = recent_cpu };
    }

    // Inserts a held lock, keeping the list ordered by donated
    // priority descending. Interrupts must be disabled.
    //
    pub(crate) fn push_held_lock(&self, lock: Lock) {
        let held = unsafe { &mut *self.held_locks.get() };
        let donated = lock.donated_priority();
        let at = held
            .iter()
            .position(|l| l.donated_priority() < donated)
            .unwrap_or(held.len());
        held.insert(at, lock);
    }

    // Removes a held lock. Interrupts must be disabled.
    //
    pub(crate) fn remove_held_lock(&self, lock: &Lock) {
        let held = unsafe { &mut *self.held_locks.get() };
        held.retain(|l| !l.is_same(lock));
    }

    // Re-inserts a held lock whose donated priority changed,
    // restoring the descending order. Interrupts must be
    // disabled.
    //
    pub(crate) fn resort_held_lock(&self, lock: &Lock) {
        self.remove_held_lock(lock);
        self.push_held_lock(lock.clone());
    }

    /// Returns the user process this thread runs, if any.
    ///
    pub fn process(&self) -> Option<Arc<Process>> {
        lock!(self.process).clone()
    }

    pub(crate) fn set_process(&self, process: Arc<Process>) {
        *lock!(self.process) = Some(process);
    }

    /// Returns this thread's children.
    ///
    pub(crate) fn children(&self) -> &Mutex<Vec<Arc<Thread>>> {
        &self.children
    }

    pub(crate) fn parent(&self) -> Option<Tid> {
        *lock!(self.parent)
    }

    pub(crate) fn set_parent(&self, parent: Option<Tid>) {
        *lock!(self.parent) = parent;
    }

    pub(super) fn baton(&self) -> &switch::Baton {
        &self.baton
    }
}

/// Initialises the threading system, transforming the caller
/// into the initial thread, named "main".
///
/// Any previous thread table is discarded, so tests can tear
/// the kernel down and boot it again.
///
pub(crate) fn init(mlfqs: bool) {
    interrupts::init();
    scheduler::init(mlfqs);

    *lock!(NEXT_TID) = 1;
    *lock!(THREADS) = BTreeMap::new();
    *lock!(IDLE) = None;

    let main = Arc::new(Thread::new(Tid::next(), "main", PRI_DEFAULT, Status::Running));
    if mlfqs {
        scheduler::recompute_mlfqs_priority(&main);
    }

    *lock!(INITIAL) = Some(main.tid());
    lock!(THREADS).insert(main.tid(), main.clone());
    *lock!(CURRENT) = Some(main);
}

/// Starts preemptive scheduling: creates the idle thread and
/// enables interrupts.
///
/// # Panics
///
/// `start` panics if the idle thread cannot be created.
///
pub(crate) fn start() {
    let started = Arc::new(super::sync::Semaphore::new(0));
    let signal = started.clone();
    let tid = spawn_blocked("idle", PRI_MIN, move || idle_loop(signal))
        .expect("failed to create the idle thread");

    *lock!(IDLE) = lookup(tid);
    resume(tid);

    interrupts::enable();

    // Wait for the idle thread to come up.
    started.down();
}

// The idle thread. Lets the machine know it has started, then
// stays off the ready queue: the scheduler returns it directly
// whenever nothing else is runnable.
//
fn idle_loop(started: Arc<super::sync::Semaphore>) {
    started.up();

    loop {
        interrupts::disable();
        scheduler::block();
    }
}

/// Creates a new thread, which starts executing `func` at the
/// given priority.
///
/// The new thread may be scheduled before `create` returns; it
/// preempts the caller immediately if it has a higher
/// effective priority.
///
pub fn create<F>(name: &str, priority: i32, func: F) -> Result<Tid, CreateError>
where
    F: FnOnce() + Send + 'static,
{
    let tid = spawn_blocked(name, priority, func)?;
    resume(tid);

    Ok(tid)
}

// Creates a new thread without scheduling it. The thread will
// not run until resume is called with its id.
//
pub(crate) fn spawn_blocked<F>(name: &str, priority: i32, func: F) -> Result<Tid, CreateError>
where
    F: FnOnce() + Send + 'static,
{
    let tid = Tid::next();
    let thread = Arc::new(Thread::new(tid, name, priority, Status::Blocked));

    if scheduler::mlfqs_enabled() {
        // MLFQ threads inherit their creator's nice value and
        // have their priority computed, not chosen.
        thread.set_nice(running_thread_nice());
        scheduler::recompute_mlfqs_priority(&thread);
    }

    let entry = thread.clone();
    std::thread::Builder::new()
        .name(String::from(thread.name()))
        .spawn(move || switch::thread_entry(entry, func))
        .map_err(|_| CreateError::OutOfMemory)?;

    interrupts::without_interrupts(|| {
        lock!(THREADS).insert(tid, thread);
    });

    Ok(tid)
}

fn running_thread_nice() -> i32 {
    match lock!(CURRENT).as_ref() {
        Some(current) => current.nice(),
        None => 0,
    }
}

/// Marks a blocked thread runnable, allowing it to run.
///
/// Returns whether the thread exists and was resumed.
///
pub fn resume(tid: Tid) -> bool {
    let thread = match lookup(tid) {
        Some(thread) => thread,
        None => return false,
    };

    interrupts::without_interrupts(|| {
        assert_eq!(thread.status(), Status::Blocked);
        scheduler::enqueue(&thread);
    });

    true
}

/// Returns the currently executing thread.
///
/// # Panics
///
/// `current` panics if the control block's magic sentinel has
/// been corrupted, which indicates a kernel stack overflow.
///
pub fn current() -> Arc<Thread> {
    let thread = super::running_thread();
    assert_eq!(thread.magic, THREAD_MAGIC, "thread control block corrupted");
    debug_assert_eq!(thread.status(), Status::Running);

    thread
}

/// Returns the id of the currently executing thread.
///
pub fn current_tid() -> Tid {
    current().tid()
}

/// Returns a copy of the current thread's name.
///
pub fn name() -> String {
    String::from(current().name())
}

/// Returns the thread with the given id, if it is still live.
///
pub fn lookup(tid: Tid) -> Option<Arc<Thread>> {
    lock!(THREADS).get(&tid).cloned()
}

/// Calls `f` on every live thread.
///
/// Interrupts must be disabled, so the set of threads cannot
/// change underneath the iteration.
///
pub(crate) fn foreach<F>(mut f: F)
where
    F: FnMut(&Arc<Thread>),
{
    debug_assert!(!interrupts::are_enabled());
    for thread in lock!(THREADS).values() {
        f(thread);
    }
}

/// Terminates the current thread and switches to the next
/// runnable thread.
///
/// # Panics
///
/// `exit` panics if called by the initial thread or the idle
/// thread, which must run for the lifetime of the machine.
///
pub fn exit() -> ! {
    assert!(!interrupts::in_interrupt());

    // Tear down the user process, if this thread runs one.
    crate::process::exit_current_process();

    terminate_current();
}

// Removes the current thread from the thread table and
// schedules away from it forever. The control block itself is
// freed by the next thread to run.
//
pub(crate) fn terminate_current() -> ! {
    assert!(!interrupts::in_interrupt());

    let current = current();
    if *lock!(INITIAL) == Some(current.tid()) {
        panic!("initial thread tried to exit");
    }

    if super::is_idle(&current) {
        panic!("idle thread tried to exit");
    }

    interrupts::disable();
    lock!(THREADS).remove(&current.tid());
    current.set_status(Status::Dying);

    if !unsafe { &*current.held_locks.get() }.is_empty() {
        error!("thread {} exited while holding locks", current.name());
    }

    drop(current);
    scheduler::schedule();
    unreachable!("exited thread was rescheduled");
}

/// Puts the current thread to sleep for `ticks` timer ticks.
///
/// The thread is woken by the timer interrupt once the tick
/// counter passes its wakeup tick.
///
pub fn sleep(ticks: i64) {
    scheduler::sleep(ticks);
}

/// Yields the CPU to the highest-priority runnable thread.
///
/// The current thread is not put to sleep and may be scheduled
/// again immediately.
///
pub fn yield_now() {
    scheduler::yield_now();
}

/// Returns the effective priority of the thread with the given
/// id, if it is still live.
///
pub fn effective_priority_of(tid: Tid) -> Option<i32> {
    interrupts::without_interrupts(|| lookup(tid).map(|t| t.effective_priority()))
}
