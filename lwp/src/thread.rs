// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The thread control block: the one allocation backing every LWP,
//! and the intrusive links the runtime and a scheduler thread through
//! it.
//!
//! Four link slots live on every descriptor, not two: the runtime
//! owns a slot in the global registry (so `tid2thread` can walk every
//! live thread) and a slot in whichever singly-linked FIFO currently
//! holds the thread (the zombie queue or a joiner's wait queue,
//! never both at once), while a scheduler implementation owns a pair
//! of slots for its own ready list. `RoundRobin` uses its pair as a
//! doubly linked queue; a different scheduler is free to use its pair
//! however it likes, or ignore one of them, since nothing outside
//! `scheduler` ever reads them.

use std::cell::{Cell, UnsafeCell};
use std::ptr;

use crate::context::{EntryFn, RegisterFile};
use crate::stack::Stack;
use crate::status::{ThreadState, ThreadStatus};

/// A thread identifier. Zero ([`NO_THREAD`]) never names a real
/// thread; it is returned in place of a `Tid` wherever the original C
/// API would have returned a negative number or a null pointer.
pub type Tid = u64;

/// The sentinel `Tid` meaning "no such thread."
pub const NO_THREAD: Tid = 0;

/// An uninhabited marker type backing [`ThreadHandle`]; never
/// constructed, only ever pointed to.
pub enum OpaqueThread {}

/// An opaque handle to a thread descriptor: the type every
/// [`Scheduler`](crate::scheduler::Scheduler) implementation operates
/// on, including ones written outside this crate.
///
/// A handle is never dereferenced by a [`Scheduler`](crate::scheduler::Scheduler)
/// implementation, only stored, compared for identity, and passed
/// back to `admit`/`remove`, exactly like the original library's
/// `thread` pointer. A null handle never names a real thread (used as
/// [`Scheduler::next`](crate::scheduler::Scheduler::next)'s
/// empty-ready-set sentinel).
pub type ThreadHandle = *mut OpaqueThread;

/// Converts a descriptor pointer to the opaque handle a [`Scheduler`](crate::scheduler::Scheduler)
/// sees. Crate-internal: nothing outside this crate ever holds a real
/// `*mut ThreadControlBlock` to convert.
pub(crate) fn handle_of(tcb: *mut ThreadControlBlock) -> ThreadHandle {
    tcb as ThreadHandle
}

/// The inverse of [`handle_of`]: recovers the descriptor pointer a
/// handle was created from. Crate-internal, used only at the
/// boundary where the runtime calls into the active scheduler.
pub(crate) fn tcb_of(handle: ThreadHandle) -> *mut ThreadControlBlock {
    handle as *mut ThreadControlBlock
}

/// One thread's complete state: its saved registers, its stack (if
/// any), its published status, and the four intrusive link slots
/// described above.
///
/// Always lives behind a raw pointer obtained from [`Box::into_raw`];
/// the runtime is the sole owner and is the only code permitted to
/// reconstitute the `Box` (in `reap`, the only place a
/// `ThreadControlBlock` is ever freed).
pub struct ThreadControlBlock {
    pub tid: Tid,
    pub registers: UnsafeCell<RegisterFile>,
    pub stack: Option<Stack>,
    pub status: Cell<ThreadStatus>,

    /// Next pointer in the runtime's registry of every live thread.
    pub all_link: Cell<*mut ThreadControlBlock>,

    /// Next pointer in whichever singly-linked FIFO currently holds
    /// this thread (the zombie queue, or a joiner's private wait
    /// list). A thread is a member of at most one such queue.
    pub queue_link: Cell<*mut ThreadControlBlock>,

    /// Scheduler-private links, read and written only by whichever
    /// [`Scheduler`](crate::scheduler::Scheduler) currently admits
    /// this thread.
    pub sched_prev: Cell<*mut ThreadControlBlock>,
    pub sched_next: Cell<*mut ThreadControlBlock>,

    /// Set only on the descriptor synthesized by `start` to stand in
    /// for the OS thread that called it. That descriptor never
    /// terminates via `exit` and so never becomes a zombie another
    /// `wait` can reap; a liveness scan must disregard it exactly as
    /// it disregards the calling thread itself, or a waiter with
    /// nothing left to wait on but "original" blocks forever. See
    /// [`Registry::non_original_tids`].
    pub is_original: bool,
}

impl ThreadControlBlock {
    /// Builds the descriptor for a brand new thread: allocates its
    /// stack and lays out its initial register file so that its
    /// first resumption calls `entry(argument)`.
    pub fn new(tid: Tid, stack: Stack, entry: EntryFn, argument: *mut u8) -> ThreadControlBlock {
        let registers = unsafe { RegisterFile::for_new_thread(&stack, entry, argument) };
        ThreadControlBlock {
            tid,
            registers: UnsafeCell::new(registers),
            stack: Some(stack),
            status: Cell::new(ThreadStatus::new(ThreadState::Live, 0)),
            all_link: Cell::new(ptr::null_mut()),
            queue_link: Cell::new(ptr::null_mut()),
            sched_prev: Cell::new(ptr::null_mut()),
            sched_next: Cell::new(ptr::null_mut()),
            is_original: false,
        }
    }

    /// Builds the descriptor standing in for the OS thread that
    /// called `start`: no stack of its own (it runs on the one it
    /// already has) and a register file that is saved into on the
    /// first switch away but never resumed from.
    pub fn original(tid: Tid) -> ThreadControlBlock {
        ThreadControlBlock {
            tid,
            registers: UnsafeCell::new(RegisterFile::blank()),
            stack: None,
            status: Cell::new(ThreadStatus::new(ThreadState::Live, 0)),
            all_link: Cell::new(ptr::null_mut()),
            queue_link: Cell::new(ptr::null_mut()),
            sched_prev: Cell::new(ptr::null_mut()),
            sched_next: Cell::new(ptr::null_mut()),
            is_original: true,
        }
    }

    pub fn registers(&self) -> *mut RegisterFile {
        self.registers.get()
    }
}

// A ThreadControlBlock is only ever touched by the single OS thread
// that owns the runtime it belongs to.
unsafe impl Send for ThreadControlBlock {}

/// A singly linked FIFO of thread descriptors, threaded through
/// [`ThreadControlBlock::queue_link`]. Used for both the zombie queue
/// and a joiner's private wait list; never both for the same thread
/// at once.
pub struct Fifo {
    head: *mut ThreadControlBlock,
    tail: *mut ThreadControlBlock,
}

impl Fifo {
    pub const fn new() -> Fifo {
        Fifo {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn push_back(&mut self, thread: *mut ThreadControlBlock) {
        unsafe {
            (*thread).queue_link.set(ptr::null_mut());
        }
        if self.tail.is_null() {
            self.head = thread;
            self.tail = thread;
        } else {
            unsafe {
                (*self.tail).queue_link.set(thread);
            }
            self.tail = thread;
        }
    }

    pub fn pop_front(&mut self) -> *mut ThreadControlBlock {
        if self.head.is_null() {
            return ptr::null_mut();
        }
        let front = self.head;
        self.head = unsafe { (*front).queue_link.get() };
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        unsafe {
            (*front).queue_link.set(ptr::null_mut());
        }
        front
    }

    /// Removes `thread` from anywhere in the queue, used when a
    /// joiner's wait list must be drained into the zombie queue at
    /// the wrong tid, or vice versa. `O(n)`, matching the original
    /// library's own linear scan.
    pub fn remove(&mut self, thread: *mut ThreadControlBlock) -> bool {
        let mut prev: *mut ThreadControlBlock = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            let next = unsafe { (*cur).queue_link.get() };
            if cur == thread {
                if prev.is_null() {
                    self.head = next;
                } else {
                    unsafe { (*prev).queue_link.set(next) };
                }
                if cur == self.tail {
                    self.tail = prev;
                }
                unsafe { (*cur).queue_link.set(ptr::null_mut()) };
                return true;
            }
            prev = cur;
            cur = next;
        }
        false
    }
}

/// The registry of every live thread, threaded through
/// [`ThreadControlBlock::all_link`]. Supports insertion, removal, and
/// lookup by `Tid` (`tid2thread`), matching the original library's
/// `all_add`/`all_remove`/`tid2thread` linear scan.
pub struct Registry {
    head: *mut ThreadControlBlock,
}

impl Registry {
    pub const fn new() -> Registry {
        Registry {
            head: ptr::null_mut(),
        }
    }

    pub fn insert(&mut self, thread: *mut ThreadControlBlock) {
        unsafe {
            (*thread).all_link.set(self.head);
        }
        self.head = thread;
    }

    pub fn remove(&mut self, thread: *mut ThreadControlBlock) {
        let mut prev: *mut ThreadControlBlock = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            let next = unsafe { (*cur).all_link.get() };
            if cur == thread {
                if prev.is_null() {
                    self.head = next;
                } else {
                    unsafe { (*prev).all_link.set(next) };
                }
                unsafe { (*cur).all_link.set(ptr::null_mut()) };
                return;
            }
            prev = cur;
            cur = next;
        }
    }

    pub fn find(&self, tid: Tid) -> *mut ThreadControlBlock {
        let mut cur = self.head;
        while !cur.is_null() {
            if unsafe { (*cur).tid } == tid {
                return cur;
            }
            cur = unsafe { (*cur).all_link.get() };
        }
        ptr::null_mut()
    }

    /// Iterates every live thread's `Tid`, excluding the descriptor
    /// synthesized by `start` for the calling OS thread. `wait`'s
    /// liveness check relies on this exclusion: "original" never
    /// terminates via `exit`, so its permanent presence in the
    /// registry must not be mistaken for a thread that could one day
    /// satisfy a pending join. No equivalent enumeration existed in
    /// the original library; this exists for `wait` and for tests.
    pub fn non_original_tids(&self) -> Vec<Tid> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                if !(*cur).is_original {
                    out.push((*cur).tid);
                }
                cur = (*cur).all_link.get();
            }
        }
        out
    }
}
