// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements user processes.
//!
//! A process is a thread with an address space: a page
//! directory, a supplemental page table, a file-descriptor
//! table and an executable loaded from the filesystem.
//!
//! [`execute`] creates a child thread that loads the
//! executable named by the command line. The parent blocks on
//! the child's lifecycle condition variable until the child
//! reports whether the load succeeded; [`wait`] blocks the
//! same way until the child exits and publishes its status.
//! The parent keeps a reference to each child's control block
//! until it has waited for it, so an exit status can never be
//! torn down before the parent reads it; a child whose parent
//! exits first runs to completion and its status is discarded.

pub mod usermode;

mod loader;

use crate::multitasking::sync::{Condvar, Lock};
use crate::multitasking::thread::{self, Thread, Tid, PRI_DEFAULT};
use crate::vm::page::SupplementalPageTable;
use crate::vm::pagedir::PageDir;
use crate::vm::{frame, mmap, swap};
use crate::{console, fs};
use filesystem::File;
use log::debug;
use memlayout::{VirtAddr, PGSIZE};
use spin::{lock, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Describes an error encountered while starting a process.
///
#[derive(Debug, Eq, PartialEq)]
pub enum ExecError {
    /// The command line was empty or longer than a page.
    BadCommandLine,

    /// The kernel could not allocate the resources for the
    /// child thread.
    Resources,

    /// The child failed to load the executable.
    LoadFailed,
}

// Where a process is in its life, as seen by its parent.
//
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Loading,
    LoadFailed,
    Running,
    Exited,
}

/// A file mapped into a process's address space.
///
#[derive(Clone)]
pub struct Mapping {
    pub file: File,
    pub base: VirtAddr,
    pub pages: usize,
}

/// The per-process state attached to a thread that runs a
/// user program.
///
pub struct Process {
    pagedir: Mutex<Option<PageDir>>,
    spt: SupplementalPageTable,

    fds: Mutex<BTreeMap<i32, File>>,
    next_fd: AtomicI32,

    mappings: Mutex<BTreeMap<i32, Mapping>>,
    next_mapid: AtomicI32,

    executable: Mutex<Option<File>>,

    // The exit status reported by the exit syscall; processes
    // killed by the kernel keep the initial -1.
    exit_status: AtomicI32,

    // Whether the executable ever loaded. Distinguishes a
    // child that failed to load from one that loaded, ran and
    // exited before the parent observed it running.
    loaded: std::sync::atomic::AtomicBool,

    lifecycle: Mutex<Lifecycle>,
    anchor: Lock,
    lifecycle_changed: Condvar,

    entry_point: Mutex<VirtAddr>,
    initial_esp: Mutex<VirtAddr>,
}

impl Process {
    fn new() -> Arc<Process> {
        Arc::new(Process {
            pagedir: Mutex::new(None),
            spt: SupplementalPageTable::new(),
            fds: Mutex::new(BTreeMap::new()),
            next_fd: AtomicI32::new(2),
            mappings: Mutex::new(BTreeMap::new()),
            next_mapid: AtomicI32::new(1),
            executable: Mutex::new(None),
            exit_status: AtomicI32::new(-1),
            loaded: std::sync::atomic::AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::Loading),
            anchor: Lock::new(),
            lifecycle_changed: Condvar::new(),
            entry_point: Mutex::new(VirtAddr::zero()),
            initial_esp: Mutex::new(VirtAddr::zero()),
        })
    }

    /// Returns the process's page directory, once the loader
    /// has created it.
    ///
    pub fn pagedir(&self) -> Option<PageDir> {
        lock!(self.pagedir).clone()
    }

    pub(crate) fn set_pagedir(&self, pagedir: PageDir) {
        *lock!(self.pagedir) = Some(pagedir);
    }

    /// Returns the process's supplemental page table.
    ///
    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// Returns the process's exit status.
    ///
    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub(crate) fn set_exit_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
    }

    /// Returns the entry point recorded by the loader.
    ///
    pub fn entry_point(&self) -> VirtAddr {
        *lock!(self.entry_point)
    }

    /// Returns the initial user stack pointer recorded by the
    /// loader, after argument setup.
    ///
    pub fn initial_esp(&self) -> VirtAddr {
        *lock!(self.initial_esp)
    }

    // File descriptors. 0 and 1 name the console and never
    // appear in the table.

    pub(crate) fn insert_fd(&self, file: File) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        lock!(self.fds).insert(fd, file);

        fd
    }

    /// Returns the open file behind a descriptor, if any.
    ///
    pub fn fd_file(&self, fd: i32) -> Option<File> {
        if fd < 2 {
            return None;
        }

        lock!(self.fds).get(&fd).cloned()
    }

    pub(crate) fn remove_fd(&self, fd: i32) -> Option<File> {
        lock!(self.fds).remove(&fd)
    }

    // Memory mappings. Read during eviction write-back, so
    // mutations happen while the frame allocation lock keeps
    // evictions out.

    pub(crate) fn insert_mapping(&self, file: File, base: VirtAddr, pages: usize) -> i32 {
        let mapid = self.next_mapid.fetch_add(1, Ordering::Relaxed);
        lock!(self.mappings).insert(mapid, Mapping { file, base, pages });

        mapid
    }

    /// Returns the mapping with the given id, if any.
    ///
    pub fn mapping(&self, mapid: i32) -> Option<Mapping> {
        lock!(self.mappings).get(&mapid).cloned()
    }

    /// Returns the file behind the mapping with the given id.
    ///
    pub fn mapping_file(&self, mapid: i32) -> Option<File> {
        self.mapping(mapid).map(|m| m.file)
    }

    pub(crate) fn remove_mapping(&self, mapid: i32) {
        lock!(self.mappings).remove(&mapid);
    }

    pub(crate) fn mapping_ids(&self) -> Vec<i32> {
        lock!(self.mappings).keys().copied().collect()
    }

    fn lifecycle(&self) -> Lifecycle {
        *lock!(self.lifecycle)
    }

    // Publishes a lifecycle change to anyone blocked on the
    // lifecycle condition variable. The caller must not hold
    // the anchor lock.
    //
    fn publish_lifecycle(&self, lifecycle: Lifecycle) {
        self.anchor.acquire();
        *lock!(self.lifecycle) = lifecycle;
        self.lifecycle_changed.broadcast(&self.anchor);
        self.anchor.release();
    }
}

/// Starts a new process running the executable named by the
/// first token of `cmdline`; the remaining tokens become its
/// arguments.
///
/// Blocks until the child reports whether the executable
/// loaded, and returns the child's id on success.
///
pub fn execute(cmdline: &str) -> Result<Tid, ExecError> {
    if cmdline.is_empty() || cmdline.len() >= PGSIZE {
        return Err(ExecError::BadCommandLine);
    }

    let argv: Vec<String> = cmdline.split(' ').filter(|s| !s.is_empty()).map(String::from).collect();
    let name = match argv.first() {
        Some(name) => name.clone(),
        None => return Err(ExecError::BadCommandLine),
    };

    let process = Process::new();
    let child_process = process.clone();
    let child_argv = argv;
    let tid = thread::spawn_blocked(&name, PRI_DEFAULT, move || {
        start_process(child_process, child_argv)
    })
    .map_err(|_| ExecError::Resources)?;

    let parent = thread::current();
    let child = thread::lookup(tid).expect("child vanished before starting");
    child.set_process(process.clone());
    child.set_parent(Some(parent.tid()));
    lock!(parent.children()).push(child);

    thread::resume(tid);

    // Wait for the child to report the load result.
    process.anchor.acquire();
    loop {
        match process.lifecycle() {
            Lifecycle::Loading => process.lifecycle_changed.wait(&process.anchor),
            Lifecycle::Running => {
                process.anchor.release();
                return Ok(tid);
            }
            Lifecycle::Exited if process.loaded.load(Ordering::Acquire) => {
                // The child loaded, ran and already exited;
                // its status stays waitable.
                process.anchor.release();
                return Ok(tid);
            }
            Lifecycle::LoadFailed | Lifecycle::Exited => {
                process.anchor.release();

                // Reap the failed child so it is not counted
                // among the waitable children.
                lock!(parent.children()).retain(|c| c.tid() != tid);
                return Err(ExecError::LoadFailed);
            }
        }
    }
}

// The body of a freshly created process thread: load the
// executable, report the result to the parent, and enter the
// user program.
//
fn start_process(process: Arc<Process>, argv: Vec<String>) {
    let outcome = loader::load(&process, &argv);

    match outcome {
        Ok((entry, esp)) => {
            *lock!(process.entry_point) = entry;
            *lock!(process.initial_esp) = esp;
            process.loaded.store(true, Ordering::Release);
            process.publish_lifecycle(Lifecycle::Running);
            usermode::enter(entry, esp);
        }
        Err(error) => {
            debug!("load failed for {}: {:?}", thread::name(), error);
            process.publish_lifecycle(Lifecycle::LoadFailed);
            thread::exit();
        }
    }
}

/// Waits for the child with the given id to exit and returns
/// its exit status.
///
/// Returns -1 if the id does not name a child of the caller,
/// or the caller has already waited for it.
///
pub fn wait(child_tid: Tid) -> i32 {
    let parent = thread::current();
    let child: Option<Arc<Thread>> = lock!(parent.children())
        .iter()
        .find(|c| c.tid() == child_tid)
        .cloned();

    let child = match child {
        Some(child) => child,
        None => return -1,
    };

    debug_assert_eq!(child.parent(), Some(parent.tid()));

    let process = match child.process() {
        Some(process) => process,
        None => return -1,
    };

    process.anchor.acquire();
    while process.lifecycle() != Lifecycle::Exited {
        process.lifecycle_changed.wait(&process.anchor);
    }

    process.anchor.release();

    let status = process.exit_status();

    // Each child can be waited for once.
    lock!(parent.children()).retain(|c| c.tid() != child_tid);

    status
}

/// Tears down the current thread's process, if it runs one.
/// Called on the way out of every thread exit.
///
pub(crate) fn exit_current_process() {
    let current = thread::current();

    // Children of any thread are orphaned when it exits; they
    // run to completion and their statuses are discarded.
    let children: Vec<Arc<Thread>> = std::mem::take(&mut *lock!(current.children()));
    for child in &children {
        child.set_parent(None);
    }

    drop(children);

    let process = match current.process() {
        Some(process) => process,
        None => return,
    };

    console::print(format_args!("{}: exit({})\n", current.name(), process.exit_status()));

    // Close the file descriptor table.
    let fds: Vec<File> = {
        let mut table = lock!(process.fds);
        std::mem::take(&mut *table).into_values().collect()
    };
    fs::with_file_system(|| drop(fds));

    // Write memory-mapped files back and drop the mappings.
    mmap::munmap_all();

    // Free the remaining pages: resident pages give up their
    // frames, swapped pages their slots. The allocation lock
    // is held across the sweep so a concurrent eviction
    // cannot free a frame out from under it.
    let table = process.spt();
    let guard = table.lock().clone();
    guard.acquire();
    if let Some(pagedir) = process.pagedir() {
        frame::with_allocation_lock(|| {
            for page in table.pages() {
                if let Some((frame, _)) = pagedir.lookup(page.vaddr()) {
                    frame::free_user_page(frame, true);
                } else if let crate::vm::page::Backing::Swap(slot) =
                    page.with_state(|state| state.backing.clone())
                {
                    swap::free(slot);
                }

                table.remove(page.vaddr());
            }
        });
    }

    guard.release();

    // Let the executable be written again.
    let executable = lock!(process.executable).take();
    if let Some(executable) = executable {
        fs::with_file_system(|| {
            executable.allow_write();
            drop(executable);
        });
    }

    // Clear the page directory pointer before switching away
    // from it, so a timer interrupt cannot reactivate a
    // directory that is about to be destroyed.
    let pagedir = lock!(process.pagedir).take();
    crate::vm::pagedir::activate(None);
    if let Some(pagedir) = pagedir {
        pagedir.destroy();
    }

    // Publish the status last, once the address space is gone:
    // a waiting parent resumes with the teardown complete.
    process.publish_lifecycle(Lifecycle::Exited);
}
