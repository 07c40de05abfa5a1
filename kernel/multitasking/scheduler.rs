// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the thread scheduler.
//!
//! The scheduler runs in one of two modes, chosen once at boot:
//!
//! - **Priority mode**: a single ready queue ordered by
//!   effective priority descending, with priority donation
//!   through locks. The highest-priority runnable thread always
//!   runs; ties are broken round-robin.
//! - **MLFQ mode**: 64 priority levels computed from each
//!   thread's recent CPU use and niceness, recomputed every
//!   four ticks, with the system load average decayed once per
//!   second. Donation is disabled; priorities are computed, not
//!   chosen.
//!
//! In both modes a thread is preempted after [`TIME_SLICE`]
//! ticks, or as soon as a higher-priority thread becomes
//! runnable.

use super::thread::{self, Status, Thread, Tid, PRI_MAX, PRI_MIN};
use super::{is_idle, running_thread, switch, CURRENT};
use crate::interrupts;
use crate::vm::pagedir;
use fixedpoint::Fixed;
use lazy_static::lazy_static;
use log::info;
use spin::{lock, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::{TimeSlice, TICKS_PER_SECOND};

/// The number of timer ticks each thread runs before it is
/// preempted.
///
pub const TIME_SLICE: i64 = 4;

// The number of ticks between MLFQ priority recomputations.
//
const MLFQS_RECOMPUTE_INTERVAL: i64 = 4;

// Whether the machine booted in MLFQ mode. Kept in an atomic
// alongside the scheduler state so the hot donation paths can
// check it without taking the scheduler lock.
//
static MLFQS: AtomicBool = AtomicBool::new(false);

struct Scheduler {
    // The ready queue, ordered by effective priority
    // descending. Ties keep insertion order, which gives
    // round-robin rotation between threads of equal priority.
    ready: VecDeque<Tid>,

    // Sleeping threads, ordered by wakeup tick ascending.
    sleeping: Vec<Tid>,

    // The running thread's remaining time slice.
    slice: TimeSlice,

    // MLFQ state.
    load_avg: Fixed,
    recompute_ticks: i64,

    // Tick statistics, by the kind of thread that was running.
    idle_ticks: i64,
    kernel_ticks: i64,
    user_ticks: i64,
}

lazy_static! {
    static ref SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);
}

/// Returns whether the machine booted in MLFQ mode.
///
pub fn mlfqs_enabled() -> bool {
    MLFQS.load(Ordering::Relaxed)
}

pub(crate) fn init(mlfqs: bool) {
    MLFQS.store(mlfqs, Ordering::Relaxed);
    *lock!(SCHEDULER) = Some(Scheduler {
        ready: VecDeque::new(),
        sleeping: Vec::new(),
        slice: TimeSlice::from_ticks(TIME_SLICE),
        load_avg: Fixed::ZERO,
        recompute_ticks: 0,
        idle_ticks: 0,
        kernel_ticks: 0,
        user_ticks: 0,
    });
}

// Runs `f` on the scheduler state.
//
fn with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(&mut Scheduler) -> R,
{
    let mut guard = lock!(SCHEDULER);
    f(guard.as_mut().expect("scheduler not initialised"))
}

// Inserts a thread into the ready queue, before the first
// entry with a strictly lower effective priority. Equal
// priorities keep FIFO order.
//
fn ordered_insert_ready(ready: &mut VecDeque<Tid>, thread: &Arc<Thread>) {
    let priority = thread.effective_priority();
    let at = ready
        .iter()
        .position(|tid| priority_of(*tid) < priority)
        .unwrap_or(ready.len());
    ready.insert(at, thread.tid());
}

fn priority_of(tid: Tid) -> i32 {
    thread::lookup(tid)
        .map(|t| t.effective_priority())
        .unwrap_or(PRI_MIN)
}

// Queues a thread onto the ready queue and preempts the
// running thread if the newcomer has a higher effective
// priority. Interrupts must be disabled.
//
pub(crate) fn enqueue(thread: &Arc<Thread>) {
    debug_assert!(!interrupts::are_enabled());

    thread.set_status(Status::Ready);
    with_scheduler(|s| ordered_insert_ready(&mut s.ready, thread));

    let current = running_thread();
    if !is_idle(&current) && thread.effective_priority() > current.effective_priority() {
        if interrupts::in_interrupt() {
            interrupts::yield_on_return();
        } else {
            yield_now();
        }
    }
}

// Removes and re-inserts a ready thread whose effective
// priority changed, restoring the queue order. Interrupts must
// be disabled.
//
pub(crate) fn reposition_ready(thread: &Arc<Thread>) {
    debug_assert!(!interrupts::are_enabled());
    with_scheduler(|s| {
        s.ready.retain(|tid| *tid != thread.tid());
        ordered_insert_ready(&mut s.ready, thread);
    });
}

// Chooses the next thread to run: the head of the ready queue,
// or the idle thread if the queue is empty.
//
fn next_thread_to_run() -> Arc<Thread> {
    let next = with_scheduler(|s| s.ready.pop_front());
    match next {
        Some(tid) => thread::lookup(tid).expect("ready thread not in thread table"),
        None => super::IDLE
            .lock()
            .clone()
            .expect("no idle thread: scheduler not started"),
    }
}

/// Yields the CPU. The current thread is requeued and may be
/// scheduled again immediately.
///
/// # Panics
///
/// `yield_now` panics if called from interrupt context;
/// handlers request a yield with `yield_on_return` instead.
///
pub fn yield_now() {
    assert!(!interrupts::in_interrupt());

    let enabled = interrupts::disable();
    let current = running_thread();
    current.set_status(Status::Ready);
    if !is_idle(&current) {
        with_scheduler(|s| ordered_insert_ready(&mut s.ready, &current));
    }

    schedule();
    interrupts::set_level(enabled);
}

/// Blocks the current thread. It will not run again until it
/// is unblocked.
///
/// Interrupts must already be disabled; it is usually a better
/// idea to use one of the synchronisation primitives.
///
pub(crate) fn block() {
    assert!(!interrupts::in_interrupt());
    assert!(!interrupts::are_enabled());

    running_thread().set_status(Status::Blocked);
    schedule();
}

/// Puts the current thread to sleep for `ticks` timer ticks,
/// inserting it into the sleep queue ordered by wakeup tick.
///
/// # Panics
///
/// `sleep` panics if called from interrupt context or by the
/// idle thread.
///
pub fn sleep(ticks: i64) {
    assert!(!interrupts::in_interrupt());

    let enabled = interrupts::disable();
    let current = running_thread();
    assert!(!is_idle(&current), "idle thread tried to sleep");

    let wakeup = time::ticks() + ticks;
    current.set_wakeup_tick(wakeup);
    with_scheduler(|s| {
        let at = s
            .sleeping
            .iter()
            .position(|tid| wakeup_tick_of(*tid) > wakeup)
            .unwrap_or(s.sleeping.len());
        s.sleeping.insert(at, current.tid());
    });

    current.set_status(Status::Sleeping);
    schedule();
    interrupts::set_level(enabled);
}

fn wakeup_tick_of(tid: Tid) -> i64 {
    thread::lookup(tid).map(|t| t.wakeup_tick()).unwrap_or(i64::MAX)
}

// Wakes every sleeping thread whose wakeup tick has passed.
// The sleep queue is sorted, so the walk stops at the first
// thread that is still in the future. Runs in the timer
// interrupt.
//
fn sleep_ticker() {
    let now = time::ticks();
    loop {
        let next = with_scheduler(|s| match s.sleeping.first() {
            Some(tid) if wakeup_tick_of(*tid) <= now => Some(s.sleeping.remove(0)),
            _ => None,
        });

        let tid = match next {
            Some(tid) => tid,
            None => return,
        };

        let thread = thread::lookup(tid).expect("sleeping thread not in thread table");
        debug_assert_eq!(thread.status(), Status::Sleeping);
        enqueue(&thread);
    }
}

/// Handles one timer tick: updates the tick statistics, wakes
/// sleeping threads, runs the MLFQ bookkeeping and enforces
/// preemption. Runs in interrupt context.
///
pub(crate) fn tick() {
    debug_assert!(interrupts::in_interrupt());

    let current = running_thread();

    with_scheduler(|s| {
        if is_idle(&current) {
            s.idle_ticks += 1;
        } else if current.process().is_some() {
            s.user_ticks += 1;
        } else {
            s.kernel_ticks += 1;
        }
    });

    sleep_ticker();

    if mlfqs_enabled() {
        if !is_idle(&current) {
            current.set_recent_cpu(current.recent_cpu().add_int(1));
        }

        // The load average feeds the recent_cpu decay, so it
        // is recomputed first.
        if time::ticks() % TICKS_PER_SECOND == 0 {
            recompute_load_avg(&current);
            thread::foreach(recompute_recent_cpu);
        }

        let recompute = with_scheduler(|s| {
            s.recompute_ticks += 1;
            if s.recompute_ticks == MLFQS_RECOMPUTE_INTERVAL {
                s.recompute_ticks = 0;
                true
            } else {
                false
            }
        });

        if recompute {
            thread::foreach(|t| recompute_mlfqs_priority(t));
            sort_ready_queue();
        }
    }

    // Enforce preemption.
    let expired = with_scheduler(|s| s.slice.tick());
    if expired {
        interrupts::yield_on_return();
    }
}

// Schedules a new thread. At entry, interrupts must be off and
// the running thread's status must have been changed from
// Running to some other state. Finds the next thread to run
// and switches to it.
//
pub(crate) fn schedule() {
    debug_assert!(!interrupts::are_enabled());
    debug_assert!(!interrupts::in_interrupt());

    let current = running_thread();
    debug_assert_ne!(current.status(), Status::Running);

    let next = next_thread_to_run();
    if Arc::ptr_eq(&current, &next) {
        // Nothing better to do than continue.
        schedule_tail();
        return;
    }

    // Switch address space, then the CPU. The new thread
    // completes the switch in schedule_tail.
    pagedir::activate(next.process().and_then(|p| p.pagedir()));
    *lock!(CURRENT) = Some(next.clone());
    switch::switch_threads(current, next);
}

// Completes a thread switch on the incoming thread's side:
// marks it running, starts a fresh time slice, and destroys
// the previous thread if it was dying. This placement
// guarantees a thread never frees its own state.
//
pub(crate) fn schedule_tail() {
    debug_assert!(!interrupts::are_enabled());

    let current = running_thread();
    current.set_status(Status::Running);
    with_scheduler(|s| s.slice = TimeSlice::from_ticks(TIME_SLICE));

    if let Some(previous) = switch::take_previous() {
        if previous.status() == Status::Dying {
            // This drop frees the control block; the thread
            // table entry was removed when the thread exited.
            debug_assert!(!Arc::ptr_eq(&previous, &current));
            drop(previous);
        }
    }
}

/// Sets the current thread's base priority and yields, in case
/// it no longer holds the highest effective priority.
///
/// Has no effect in MLFQ mode, where priorities are computed.
///
/// # Panics
///
/// `set_priority` panics if the priority is out of range.
///
pub fn set_priority(priority: i32) {
    assert!((PRI_MIN..=PRI_MAX).contains(&priority));
    if mlfqs_enabled() {
        return;
    }

    interrupts::without_interrupts(|| {
        thread::current().set_base_priority(priority);
    });

    yield_now();
}

/// Returns the current thread's effective priority.
///
pub fn get_priority() -> i32 {
    interrupts::without_interrupts(|| thread::current().effective_priority())
}

/// Sets the current thread's nice value, recomputes its
/// priority and yields if it is no longer the highest.
///
/// # Panics
///
/// `set_nice` panics unless the machine booted in MLFQ mode
/// and the value is in `[-20, 20]`.
///
pub fn set_nice(nice: i32) {
    assert!(mlfqs_enabled());
    assert!((-20..=20).contains(&nice));

    let should_yield = interrupts::without_interrupts(|| {
        let current = thread::current();
        current.set_nice(nice);
        recompute_mlfqs_priority(&current);
        sort_ready_queue();

        with_scheduler(|s| match s.ready.front() {
            Some(head) => priority_of(*head) > current.effective_priority(),
            None => false,
        })
    });

    if should_yield {
        yield_now();
    }
}

/// Returns the current thread's nice value.
///
pub fn get_nice() -> i32 {
    thread::current().nice()
}

/// Returns 100 times the system load average, rounded to the
/// nearest integer.
///
pub fn get_load_avg() -> i32 {
    interrupts::without_interrupts(|| with_scheduler(|s| s.load_avg.mul_int(100).to_int_nearest()))
}

/// Returns 100 times the current thread's recent CPU use,
/// rounded to the nearest integer.
///
pub fn get_recent_cpu() -> i32 {
    interrupts::without_interrupts(|| thread::current().recent_cpu().mul_int(100).to_int_nearest())
}

/// Prints the tick statistics through the logger.
///
pub fn print_stats() {
    let (idle, kernel, user) = interrupts::without_interrupts(|| {
        with_scheduler(|s| (s.idle_ticks, s.kernel_ticks, s.user_ticks))
    });

    info!("Thread: {} idle ticks, {} kernel ticks, {} user ticks", idle, kernel, user);
}

/// Returns the tick counts recorded for idle, kernel and user
/// threads.
///
pub fn stats() -> (i64, i64, i64) {
    interrupts::without_interrupts(|| {
        with_scheduler(|s| (s.idle_ticks, s.kernel_ticks, s.user_ticks))
    })
}

// Recomputes the priority of an MLFQ thread:
// PRI_MAX - recent_cpu/4 - nice*2, clamped to the priority
// range. The division truncates toward zero.
//
pub(crate) fn recompute_mlfqs_priority(thread: &Arc<Thread>) {
    let priority = PRI_MAX - thread.recent_cpu().to_int_nearest() / 4 - thread.nice() * 2;
    thread.set_base_priority(priority.clamp(PRI_MIN, PRI_MAX));
}

// Recomputes the system load average:
// (59/60)*load_avg + (1/60)*ready_count, where ready_count
// includes the running thread unless it is idle.
//
fn recompute_load_avg(current: &Arc<Thread>) {
    with_scheduler(|s| {
        let mut ready_count = s.ready.len() as i32;
        if !is_idle(current) {
            ready_count += 1;
        }

        let fifty_nine_sixtieths = Fixed::from_int(59) / Fixed::from_int(60);
        let one_sixtieth = Fixed::from_int(1) / Fixed::from_int(60);
        s.load_avg = fifty_nine_sixtieths * s.load_avg + one_sixtieth.mul_int(ready_count);
    });
}

// Recomputes a thread's recent CPU use:
// (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice.
//
fn recompute_recent_cpu(thread: &Arc<Thread>) {
    let load_avg = with_scheduler(|s| s.load_avg);
    let twice_load = load_avg.mul_int(2);
    let coefficient = twice_load / twice_load.add_int(1);
    thread.set_recent_cpu((coefficient * thread.recent_cpu()).add_int(thread.nice()));
}

// Re-sorts the ready queue by priority descending after a
// recomputation. The sort is stable, so threads of equal
// priority keep rotating fairly.
//
fn sort_ready_queue() {
    with_scheduler(|s| {
        let mut threads: Vec<Tid> = s.ready.iter().copied().collect();
        threads.sort_by_key(|tid| std::cmp::Reverse(priority_of(*tid)));
        s.ready = threads.into_iter().collect();
    });
}
