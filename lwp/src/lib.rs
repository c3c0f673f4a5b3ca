// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A cooperatively-scheduled, user-space lightweight process (LWP)
//! runtime.
//!
//! Every LWP shares one OS thread with every other LWP created
//! through the same [`start`] call: there is no preemption, no SMP,
//! and no locking anywhere in this crate, because there is never more
//! than one of these threads running at a time. A thread only ever
//! changes at an explicit call to [`yield_now`], [`exit`], [`start`],
//! or [`wait`].
//!
//! ```no_run
//! extern "C" fn worker(arg: *mut u8) -> i32 {
//!     let id = arg as usize as i32;
//!     for _ in 0..3 {
//!         println!("thread {id}");
//!         lwp::yield_now();
//!     }
//!     id
//! }
//!
//! lwp::create(worker, 1 as *mut u8, 0);
//! lwp::create(worker, 2 as *mut u8, 0);
//! lwp::start();
//! ```
//!
//! A [`Runtime`](crate::runtime) instance is held in a
//! `std::thread_local!`, so calling [`start`] from more than one OS
//! thread gives each of them its own fully independent scheduling
//! domain; no LWP runtime ever spans more than one OS thread, matching
//! the single-OS-thread contract this crate implements.
//!
//! This crate carries no logging and no configuration layer by
//! design: nothing here is ever retried or reported, only returned as
//! a sentinel ([`NO_THREAD`]) or an `Option`, exactly as the original
//! C library's contract specifies. See `DESIGN.md` for the full
//! rationale.

mod context;
mod runtime;
mod scheduler;
mod stack;
mod status;
mod thread;

pub mod abi;

pub use context::EntryFn;
pub use runtime::SchedulerHandle;
pub use scheduler::{RoundRobin, Scheduler};
pub use status::{ThreadState, ThreadStatus};
pub use thread::{Tid, ThreadHandle, NO_THREAD};

use std::cell::RefCell;
use std::rc::Rc;

/// Creates a new thread running `entry(argument)` and makes it
/// runnable, returning its [`Tid`].
///
/// `stack_hint` is an advisory minimum stack size in bytes; `0`
/// defers entirely to the provisioner's own sizing (the process's
/// stack `rlimit`, or 8 MiB, whichever is larger). Returns
/// [`NO_THREAD`] if the new thread's stack could not be allocated.
pub fn create(entry: EntryFn, argument: *mut u8, stack_hint: usize) -> Tid {
    runtime::create(entry, argument, stack_hint)
}

/// Creates a new thread running the given closure, returning its
/// [`Tid`].
///
/// This is an ergonomic wrapper over [`create`] for Rust callers who
/// have no need for the C-callable `extern "C" fn` entry point: the
/// closure is boxed, its address passed through [`create`]'s opaque
/// `argument`, and unboxed and invoked by a fixed trampoline entry
/// function on the new thread's first resumption. Returns
/// [`NO_THREAD`] under the same conditions as [`create`].
pub fn spawn<F>(stack_hint: usize, f: F) -> Tid
where
    F: FnOnce() -> i32 + 'static,
{
    extern "C" fn call_boxed_closure<F>(argument: *mut u8) -> i32
    where
        F: FnOnce() -> i32 + 'static,
    {
        let boxed = unsafe { Box::from_raw(argument as *mut F) };
        boxed()
    }

    let boxed = Box::new(f);
    let argument = Box::into_raw(boxed) as *mut u8;
    let tid = create(call_boxed_closure::<F>, argument, stack_hint);
    if tid == NO_THREAD {
        // create failed before admitting the thread; reclaim the
        // closure instead of leaking it.
        drop(unsafe { Box::from_raw(argument as *mut F) });
    }
    tid
}

/// Converts the calling OS thread into the scheduling context for
/// every LWP created so far on it, and runs the cooperative dispatch
/// loop until no thread anywhere is runnable, at which point it
/// returns to its caller exactly like an ordinary function.
///
/// Idempotent: a second call on the same OS thread resumes the same
/// dispatch loop rather than creating a second synthetic thread for
/// the caller. If some other LWP, rather than this loop, discovers it
/// is the last runnable thread anywhere (by calling [`yield_now`] or
/// [`exit`] with nothing left to hand off to), the process ends there
/// via [`std::process::exit`] instead; see those functions.
pub fn start() {
    runtime::start()
}

/// Gives up the rest of the calling thread's turn.
///
/// A no-op if no other thread is runnable; otherwise resumes whichever
/// thread the active scheduler picks next, and returns once some
/// later `yield_now` (by that thread or another) hands control back
/// to the caller.
pub fn yield_now() {
    runtime::yield_now()
}

/// Terminates the calling thread with `code` (truncated to its low 8
/// bits before being published to [`wait`]) and never returns.
///
/// Wakes one thread blocked in [`wait`] if any is waiting for this
/// thread (or for any thread); otherwise the terminated thread sits in
/// the zombie queue until some future `wait` reaps it.
pub fn exit(code: i32) -> ! {
    runtime::exit(code)
}

/// Blocks until some other thread terminates, reaps it, and returns
/// its [`Tid`]. If `status` is `Some`, the reaped thread's published
/// [`ThreadStatus`] is written through it.
///
/// Returns [`NO_THREAD`] without blocking if no other thread exists
/// that could ever terminate (the conservative, likely-dead path
/// spec.md documents: reachable only if a caller waits having created
/// nothing and nothing else is live).
pub fn wait(status: Option<&mut ThreadStatus>) -> Tid {
    match runtime::wait() {
        Some((tid, published)) => {
            if let Some(out) = status {
                *out = published;
            }
            tid
        }
        None => NO_THREAD,
    }
}

/// Returns the calling thread's [`Tid`], or [`NO_THREAD`] if called
/// before [`create`] or [`start`] has ever run on this OS thread.
pub fn gettid() -> Tid {
    runtime::gettid()
}

/// Returns `Some(tid)` if `tid` names a thread this runtime currently
/// knows about (live or not yet reaped), `None` otherwise.
///
/// The original library returns an opaque `thread` pointer here; this
/// crate never exposes the thread control block itself to safe Rust
/// callers, so the existence check is what survives the translation.
pub fn tid2thread(tid: Tid) -> Option<Tid> {
    if runtime::tid2thread(tid) {
        Some(tid)
    } else {
        None
    }
}

/// Installs `scheduler` as the active scheduling policy, or reverts to
/// the default round-robin policy if `scheduler` is `None`.
///
/// Every thread admitted to the outgoing scheduler is migrated to the
/// incoming one before the outgoing one is shut down; the currently
/// running thread (not being in the ready set) is never migrated. A
/// no-op if the given scheduler is already active.
pub fn set_scheduler<S>(scheduler: Option<S>)
where
    S: Scheduler + 'static,
{
    let handle = scheduler.map(|s| Rc::new(RefCell::new(s)) as SchedulerHandle);
    runtime::set_scheduler(handle)
}

/// Installs an already-constructed [`SchedulerHandle`] as the active
/// scheduler, or reverts to the default if `None`. Useful for
/// re-installing a handle previously obtained from [`get_scheduler`].
pub fn set_scheduler_handle(scheduler: Option<SchedulerHandle>) {
    runtime::set_scheduler(scheduler)
}

/// Returns a shared handle to the currently active scheduler.
pub fn get_scheduler() -> SchedulerHandle {
    runtime::get_scheduler()
}

/// Returns the number of threads currently admitted to the active
/// scheduler: neither running, blocked in [`wait`], nor zombied.
pub fn scheduler_qlen() -> usize {
    runtime::scheduler_qlen()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc as StdRc;

    thread_local! {
        static REAPS: RefCell<Vec<(Tid, u8)>> = RefCell::new(Vec::new());
    }

    extern "C" fn returns_immediately(_arg: *mut u8) -> i32 {
        0
    }

    extern "C" fn yields_then_returns(arg: *mut u8) -> i32 {
        let id = arg as usize as i32;
        yield_now();
        id
    }

    #[test]
    fn create_returns_unique_tids() {
        let a = create(returns_immediately, std::ptr::null_mut(), 0);
        let b = create(returns_immediately, std::ptr::null_mut(), 0);
        assert_ne!(a, NO_THREAD);
        assert_ne!(b, NO_THREAD);
        assert_ne!(a, b);
        // Drain the runtime so later tests in the same thread_local
        // start from an empty ready set.
        start();
    }

    #[test]
    fn reaper_observes_every_worker_exactly_once() {
        const N: i32 = 3;
        for i in 0..N {
            create(yields_then_returns, i as usize as *mut u8, 0);
        }

        extern "C" fn reaper(_arg: *mut u8) -> i32 {
            loop {
                let mut status = ThreadStatus::new(ThreadState::Live, 0);
                let tid = wait(Some(&mut status));
                if tid == NO_THREAD {
                    break;
                }
                REAPS.with(|r| r.borrow_mut().push((tid, status.exit_code())));
            }
            0
        }
        create(reaper, std::ptr::null_mut(), 0);
        start();

        REAPS.with(|r| {
            let reaps = r.borrow();
            assert_eq!(reaps.len(), N as usize);
            let mut codes: Vec<u8> = reaps.iter().map(|(_, c)| *c).collect();
            codes.sort_unstable();
            assert_eq!(codes, vec![0, 1, 2]);
        });
    }

    #[test]
    fn tid2thread_is_none_for_unknown_tid() {
        assert_eq!(tid2thread(999_999), None);
    }

    #[test]
    fn set_scheduler_none_reinstalls_the_same_default_handle() {
        let before = get_scheduler();
        set_scheduler::<RoundRobin>(None);
        let after = get_scheduler();
        assert!(StdRc::ptr_eq(&before, &after));
    }

    #[test]
    fn gettid_is_no_thread_before_start() {
        // Each #[test] fn runs on its own fresh OS thread in the
        // default test harness, so this thread_local's runtime has
        // never had `create` or `start` called on it yet.
        assert_eq!(gettid(), NO_THREAD);
    }
}
