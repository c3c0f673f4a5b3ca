// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The runtime core: thread creation, the cooperative dispatch loop,
//! and the join/reap lifecycle.
//!
//! One `Runtime` exists per OS thread that calls into this crate,
//! held in a `thread_local!` rather than behind a process-wide lock:
//! the library is contractually single-OS-thread (see the module
//! documentation in `lib.rs`), so there is never contention to
//! arbitrate.

use std::cell::RefCell;
use std::ptr;
use std::rc::Rc;

use crate::context::{self, EntryFn};
use crate::scheduler::{RoundRobin, Scheduler};
use crate::stack::Stack;
use crate::status::{ThreadState, ThreadStatus};
use crate::thread::{handle_of, tcb_of, Fifo, Registry, ThreadControlBlock, Tid, NO_THREAD};

/// A shared handle to an installed [`Scheduler`], the Rust realization
/// of the original library's scheduler vtable pointer: cheap to clone,
/// and two handles compare equal (via [`Rc::ptr_eq`], see
/// [`set_scheduler`]) exactly when they name the same installed
/// policy.
pub type SchedulerHandle = Rc<RefCell<dyn Scheduler>>;

struct Runtime {
    registry: Registry,
    zombies: Fifo,
    waiters: Fifo,
    scheduler: SchedulerHandle,
    default_scheduler: SchedulerHandle,
    current: *mut ThreadControlBlock,
    original: *mut ThreadControlBlock,
    next_tid: Tid,
}

impl Runtime {
    fn new() -> Runtime {
        let default_scheduler: SchedulerHandle = Rc::new(RefCell::new(RoundRobin::new()));
        Runtime {
            registry: Registry::new(),
            zombies: Fifo::new(),
            waiters: Fifo::new(),
            scheduler: default_scheduler.clone(),
            default_scheduler,
            current: ptr::null_mut(),
            original: ptr::null_mut(),
            next_tid: 1,
        }
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }
}

thread_local! {
    static RUNTIME: RefCell<Runtime> = RefCell::new(Runtime::new());
}

/// Aborts the process immediately, with nothing written to any
/// stream: reached only when an internal invariant this crate
/// maintains itself has broken (a blocked or exiting thread finds no
/// thread at all left to resume into, which can only happen if the
/// caller never called [`start`] in the first place).
fn fatal() -> ! {
    std::process::abort()
}

/// The live thread currently executing, or a null pointer if neither
/// [`create`] nor [`start`] has run yet on this OS thread.
fn current() -> *mut ThreadControlBlock {
    RUNTIME.with(|rt| rt.borrow().current)
}

/// Transfers control from whichever thread is running to `next`,
/// saving the outgoing thread's registers first. A no-op if `next`
/// is already current.
fn switch_to(next: *mut ThreadControlBlock) {
    let prev = RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        let prev = rt.current;
        rt.current = next;
        prev
    });
    if prev == next {
        return;
    }
    unsafe {
        context::switch((*prev).registers(), (*next).registers());
    }
}

/// Transfers control to `next` without saving anything: used only by
/// [`exit`], whose outgoing register state will never be resumed.
fn switch_to_discarding_current(next: *mut ThreadControlBlock) -> ! {
    RUNTIME.with(|rt| rt.borrow_mut().current = next);
    unsafe {
        context::switch(ptr::null_mut(), (*next).registers());
    }
    unreachable!("a thread that called exit must never be resumed")
}

/// Creates a new thread running `entry(argument)` and admits it to
/// the active scheduler. `stack_hint` is an advisory minimum stack
/// size in bytes; `0` accepts the scheduler's own default sizing.
///
/// Returns [`NO_THREAD`] if the stack for the new thread could not be
/// allocated; otherwise returns the new thread's `Tid`.
pub fn create(entry: EntryFn, argument: *mut u8, stack_hint: usize) -> Tid {
    let stack = match Stack::allocate(stack_hint) {
        Ok(stack) => stack,
        Err(_) => return NO_THREAD,
    };

    RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        let tid = rt.alloc_tid();
        let tcb = Box::into_raw(Box::new(ThreadControlBlock::new(tid, stack, entry, argument)));
        rt.registry.insert(tcb);
        rt.scheduler.borrow_mut().admit(handle_of(tcb));
        tid
    })
}

/// Converts the calling OS thread into the scheduling context for
/// every LWP created so far, and runs the cooperative dispatch loop
/// until no thread anywhere is runnable, at which point it returns
/// to its caller exactly like an ordinary function.
///
/// Safe, and cheap, to call again later: any threads created after
/// the first call resume being scheduled from wherever the loop left
/// off.
pub fn start() {
    let original = RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        if rt.original.is_null() {
            let tid = rt.alloc_tid();
            let tcb = Box::into_raw(Box::new(ThreadControlBlock::original(tid)));
            rt.registry.insert(tcb);
            rt.current = tcb;
            rt.original = tcb;
        }
        rt.original
    });

    loop {
        let next = RUNTIME.with(|rt| {
            let mut rt = rt.borrow_mut();
            // Ask whether anything else is already runnable before
            // admitting `original` itself. Self-admitting first and
            // then asking `next()` only produces the right answer if
            // the active scheduler treats a just-admitted thread as
            // lower priority than everything already waiting, which
            // holds for `RoundRobin`'s FIFO `admit` but is not part of
            // the `Scheduler` contract: a LIFO-style policy would hand
            // `original` straight back on the very next `next()` call.
            // Admitting only once something else is confirmed runnable
            // means `original` can never be the thread `next()` itself
            // just returned.
            let next = tcb_of(rt.scheduler.borrow_mut().next());
            if !next.is_null() {
                rt.scheduler.borrow_mut().admit(handle_of(original));
            }
            next
        });
        if next.is_null() {
            break;
        }
        switch_to(next);
    }
}

/// Gives up the rest of the calling thread's turn, resuming whichever
/// other thread the scheduler picks next, and returns once the
/// calling thread is chosen again.
///
/// A no-op if the calling thread is the only one admitted. If no
/// thread at all is admitted (the caller was the last runnable LWP
/// anywhere), this is how the process ends: it exits via
/// [`std::process::exit`] with the caller's current exit code (`0`,
/// since a live thread's published status is never anything else).
pub fn yield_now() {
    let me = current();
    if me.is_null() {
        return;
    }
    let next = RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        rt.scheduler.borrow_mut().admit(handle_of(me));
        tcb_of(rt.scheduler.borrow_mut().next())
    });
    if next.is_null() {
        // The calling thread just re-admitted itself and is still the
        // only runnable thread anywhere: there is nothing left to
        // hand control to. This is the documented process-exit path,
        // not a broken invariant, so it exits rather than aborting.
        let code = unsafe { (*me).status.get().exit_code() };
        std::process::exit(code as i32);
    }
    switch_to(next);
}

/// Terminates the calling thread with `code` (truncated to 8 bits),
/// waking one blocked joiner if any is waiting, and never returns.
pub fn exit(code: i32) -> ! {
    let me = current();
    if me.is_null() {
        fatal();
    }
    unsafe {
        (*me).status.set(ThreadStatus::new(ThreadState::Terminated, (code & 0xFF) as u8));
    }

    let next = RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        rt.zombies.push_back(me);
        let waiter = rt.waiters.pop_front();
        if !waiter.is_null() {
            rt.scheduler.borrow_mut().admit(handle_of(waiter));
        }
        tcb_of(rt.scheduler.borrow_mut().next())
    });
    if next.is_null() {
        // The thread that just exited was the last runnable thread
        // and woke no waiter: this is how a well-formed program built
        // only of LWPs terminates (spec.md §6), so the process exits
        // with this thread's own just-published exit code.
        std::process::exit((code & 0xFF) as i32);
    }
    switch_to_discarding_current(next)
}

/// Blocks the calling thread until some other thread terminates, then
/// reaps it and returns its `Tid` and published status.
///
/// Returns `None` without blocking if no thread other than the caller
/// exists at all (nothing could ever satisfy the request).
pub fn wait() -> Option<(Tid, ThreadStatus)> {
    loop {
        if let Some(reaped) = try_reap() {
            return Some(reaped);
        }

        let me = current();
        if me.is_null() {
            return None;
        }

        let hopeless = RUNTIME.with(|rt| {
            let rt = rt.borrow();
            // Ignore "original" here: it must never be mistaken for a
            // thread that could one day wake this waiter, or a caller
            // with nothing left to wait on but "original" blocks
            // forever instead of observing NO_THREAD (see
            // non_original_tids's documentation).
            rt.registry.non_original_tids().into_iter().all(|t| t == unsafe { (*me).tid })
        });
        if hopeless {
            return None;
        }

        let next = RUNTIME.with(|rt| {
            let mut rt = rt.borrow_mut();
            rt.waiters.push_back(me);
            tcb_of(rt.scheduler.borrow_mut().next())
        });
        if next.is_null() {
            fatal();
        }
        switch_to(next);
    }
}

/// Pops the head of the zombie queue, reaping and returning it if
/// present.
fn try_reap() -> Option<(Tid, ThreadStatus)> {
    RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        let found = rt.zombies.pop_front();
        if found.is_null() {
            return None;
        }

        let tid = unsafe { (*found).tid };
        let status = unsafe { (*found).status.get() };
        rt.registry.remove(found);
        unsafe {
            drop(Box::from_raw(found));
        }
        Some((tid, status))
    })
}

/// Returns the calling thread's `Tid`, or [`NO_THREAD`] if called
/// before [`create`] or [`start`] has ever run.
pub fn gettid() -> Tid {
    let me = current();
    if me.is_null() {
        NO_THREAD
    } else {
        unsafe { (*me).tid }
    }
}

/// Returns `true` if `tid` names a thread this runtime currently
/// knows about, live or not yet reaped.
pub fn tid2thread(tid: Tid) -> bool {
    RUNTIME.with(|rt| !rt.borrow().registry.find(tid).is_null())
}

/// Returns the raw descriptor pointer for `tid`, or a null pointer if
/// unknown. Only used across the `abi` boundary, where a C caller
/// receives this as an opaque `thread` handle exactly as the original
/// library returns one from its own `tid2thread`.
pub(crate) fn find_thread(tid: Tid) -> *mut ThreadControlBlock {
    RUNTIME.with(|rt| rt.borrow().registry.find(tid))
}

/// Installs `new` as the active scheduler, transactionally: `new` is
/// initialized, every thread admitted to the outgoing scheduler is
/// moved over to it in its own `next()` order, and only then is the
/// outgoing scheduler shut down and dropped. A no-op if `new` already
/// is the active scheduler. `new == None` reinstalls this runtime's
/// one fixed default (round-robin) handle, so that two `None` calls in
/// a row really are a no-op on the second one, not a swap between two
/// otherwise-identical round-robin instances.
pub fn set_scheduler(new: Option<SchedulerHandle>) {
    RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        let new = new.unwrap_or_else(|| rt.default_scheduler.clone());
        if Rc::ptr_eq(&rt.scheduler, &new) {
            return;
        }
        new.borrow_mut().init();
        loop {
            let t = rt.scheduler.borrow_mut().next();
            if t.is_null() {
                break;
            }
            new.borrow_mut().admit(t);
        }
        rt.scheduler.borrow_mut().shutdown();
        rt.scheduler = new;
    });
}

/// Returns a shared handle to the currently active scheduler.
pub fn get_scheduler() -> SchedulerHandle {
    RUNTIME.with(|rt| rt.borrow().scheduler.clone())
}

/// Returns the number of threads currently admitted to the active
/// scheduler (neither running nor blocked nor zombied).
pub fn scheduler_qlen() -> usize {
    RUNTIME.with(|rt| rt.borrow().scheduler.borrow().qlen())
}
