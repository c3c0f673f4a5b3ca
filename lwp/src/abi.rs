// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The C-callable surface: `#[no_mangle] unsafe extern "C"` wrappers
//! matching the shape of the original `liblwp.h`/`schedulers.h`
//! contract, so this crate links into a C program exactly as
//! `liblwp.so` did.
//!
//! A C scheduler is a `#[repr(C)]` table of six function pointers
//! ([`LwpSchedulerVtable`]) with no instance data, mirroring the
//! original library's free global functions operating on a module's
//! own static state. [`CScheduler`] adapts such a table to this
//! crate's [`Scheduler`] trait so it can be installed through
//! [`lwp_set_scheduler`] exactly like any native Rust scheduler.

use std::cell::{Cell, RefCell};
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::rc::Rc;

use crate::scheduler::Scheduler;
use crate::status::{ThreadState, ThreadStatus};
use crate::thread::{ThreadHandle, Tid, NO_THREAD};

/// The worker entry point signature every C-created thread runs.
pub type LwpEntry = extern "C" fn(*mut c_void) -> c_int;

/// An opaque handle to a thread descriptor, as returned by
/// [`tid2thread`] and passed to a C scheduler's vtable functions.
/// Never dereferenced on the Rust side of this boundary; a C caller
/// must treat it exactly as opaque as the original library's `thread`
/// pointer.
pub type LwpThread = *mut c_void;

/// The C-callable scheduler vtable, `#[repr(C)]` for a stable layout
/// third parties can build against from C or any other language with
/// a C FFI. `init`, `shutdown`, and `qlen` are optional, matching
/// spec.md's "optional" annotations on those three operations; `admit`,
/// `remove`, and `next` are mandatory.
#[repr(C)]
pub struct LwpSchedulerVtable {
    pub init: Option<extern "C" fn()>,
    pub shutdown: Option<extern "C" fn()>,
    pub admit: extern "C" fn(LwpThread),
    pub remove: extern "C" fn(LwpThread),
    pub next: extern "C" fn() -> LwpThread,
    pub qlen: Option<extern "C" fn() -> c_int>,
}

/// Adapts a C-supplied [`LwpSchedulerVtable`] to this crate's
/// [`Scheduler`] trait.
///
/// # Safety
///
/// The pointed-to vtable must outlive every call this adapter makes
/// into it, and every function it names must uphold the same
/// single-OS-thread, non-reentrant contract every native [`Scheduler`]
/// does.
pub struct CScheduler {
    vtable: *const LwpSchedulerVtable,
}

impl CScheduler {
    /// # Safety
    ///
    /// See the struct documentation.
    unsafe fn new(vtable: *const LwpSchedulerVtable) -> CScheduler {
        CScheduler { vtable }
    }

    fn vtable(&self) -> &LwpSchedulerVtable {
        unsafe { &*self.vtable }
    }
}

impl Scheduler for CScheduler {
    fn init(&mut self) {
        if let Some(f) = self.vtable().init {
            f();
        }
    }

    fn shutdown(&mut self) {
        if let Some(f) = self.vtable().shutdown {
            f();
        }
    }

    fn admit(&mut self, thread: ThreadHandle) {
        (self.vtable().admit)(thread as LwpThread);
    }

    fn remove(&mut self, thread: ThreadHandle) {
        (self.vtable().remove)(thread as LwpThread);
    }

    fn next(&mut self) -> ThreadHandle {
        (self.vtable().next)() as ThreadHandle
    }

    fn qlen(&self) -> usize {
        match self.vtable().qlen {
            Some(f) => f().max(0) as usize,
            None => 0,
        }
    }
}

thread_local! {
    /// The vtable pointer most recently installed through
    /// [`lwp_set_scheduler`], so [`lwp_get_scheduler`] can hand the
    /// same pointer back. `None` once the active scheduler is this
    /// crate's own default or was installed through the Rust API
    /// instead of this ABI.
    static ACTIVE_C_VTABLE: Cell<*const LwpSchedulerVtable> = Cell::new(ptr::null());
}

/// Creates a new thread running `function(argument)`, admits it to
/// the active scheduler, and returns its `tid_t` (or [`NO_THREAD`] on
/// allocation failure).
#[no_mangle]
pub unsafe extern "C" fn lwp_create(function: LwpEntry, argument: *mut c_void, stack_hint: usize) -> Tid {
    // `extern "C" fn(*mut c_void) -> c_int` and this crate's
    // `EntryFn` (`extern "C" fn(*mut u8) -> i32`) agree on calling
    // convention and argument width; this transmute only changes the
    // pointee type the signature advertises.
    let entry: crate::context::EntryFn = std::mem::transmute(function);
    crate::runtime::create(entry, argument as *mut u8, stack_hint)
}

/// Converts the calling OS thread into the scheduler and runs the
/// cooperative dispatch loop until it drains.
#[no_mangle]
pub extern "C" fn lwp_start() {
    crate::runtime::start()
}

/// Gives up the rest of the calling thread's turn.
#[no_mangle]
pub extern "C" fn lwp_yield() {
    crate::runtime::yield_now()
}

/// Terminates the calling thread with `exitval` (truncated to 8 bits)
/// and never returns.
#[no_mangle]
pub extern "C" fn lwp_exit(exitval: c_int) -> ! {
    crate::runtime::exit(exitval)
}

/// Blocks until any thread terminates, reaps it, writes its packed
/// status through `status` (if non-null), and returns its `tid_t`, or
/// [`NO_THREAD`] if no thread could ever satisfy the wait.
///
/// # Safety
///
/// `status`, if non-null, must point to valid, writable memory for an
/// `c_int`.
#[no_mangle]
pub unsafe extern "C" fn lwp_wait(status: *mut c_int) -> Tid {
    match crate::runtime::wait() {
        Some((tid, published)) => {
            if !status.is_null() {
                *status = published.raw() as c_int;
            }
            tid
        }
        None => NO_THREAD,
    }
}

/// Returns the calling thread's `tid_t`, or [`NO_THREAD`].
#[no_mangle]
pub extern "C" fn lwp_gettid() -> Tid {
    crate::runtime::gettid()
}

/// Returns the thread descriptor for `tid`, or a null pointer if
/// unknown. The returned handle is valid until that thread is reaped
/// by some future `lwp_wait`; using it afterward is undefined, exactly
/// as with the original library's `tid2thread`.
#[no_mangle]
pub extern "C" fn tid2thread(tid: Tid) -> LwpThread {
    crate::runtime::find_thread(tid) as LwpThread
}

/// Installs `scheduler` as the active scheduler, or reverts to the
/// built-in round-robin default if `scheduler` is null.
///
/// # Safety
///
/// `scheduler`, if non-null, must point to a valid
/// [`LwpSchedulerVtable`] that outlives every future scheduling
/// operation until it is replaced by another `lwp_set_scheduler` call.
#[no_mangle]
pub unsafe extern "C" fn lwp_set_scheduler(scheduler: *const LwpSchedulerVtable) {
    if scheduler.is_null() {
        crate::set_scheduler_handle(None);
        ACTIVE_C_VTABLE.with(|v| v.set(ptr::null()));
        return;
    }
    let adapter: Rc<RefCell<dyn Scheduler>> = Rc::new(RefCell::new(CScheduler::new(scheduler)));
    crate::set_scheduler_handle(Some(adapter));
    ACTIVE_C_VTABLE.with(|v| v.set(scheduler));
}

/// Returns the vtable most recently installed through
/// [`lwp_set_scheduler`], or a null pointer if the active scheduler is
/// this crate's own built-in default (or was installed through the
/// native Rust API rather than this one).
#[no_mangle]
pub extern "C" fn lwp_get_scheduler() -> *const LwpSchedulerVtable {
    ACTIVE_C_VTABLE.with(|v| v.get())
}

/// Packs `state`/`termcode` into the raw status word `lwp_wait`
/// publishes, mirroring the original `MKTERMSTAT` macro. `state` is
/// nonzero for terminated, zero for live; `termcode` is masked to 8
/// bits.
#[no_mangle]
pub extern "C" fn lwp_mkstat(state: c_int, termcode: c_int) -> u16 {
    let state = if state != 0 { ThreadState::Terminated } else { ThreadState::Live };
    ThreadStatus::new(state, (termcode & 0xFF) as u8).raw()
}

/// Decodes the state half of a packed status word, mirroring the
/// original `LWPSTATE` macro: `0` for live, nonzero for terminated.
#[no_mangle]
pub extern "C" fn lwp_state(status: u16) -> c_int {
    match ThreadStatus::from_raw(status).state() {
        ThreadState::Live => 0,
        ThreadState::Terminated => 1,
    }
}

/// Decodes the exit-code half of a packed status word, mirroring the
/// original `LWPTERMSTAT` macro.
#[no_mangle]
pub extern "C" fn lwp_termstat(status: u16) -> c_int {
    ThreadStatus::from_raw(status).exit_code() as c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop_admit(_t: LwpThread) {}
    extern "C" fn noop_remove(_t: LwpThread) {}
    extern "C" fn no_thread_next() -> LwpThread {
        ptr::null_mut()
    }

    #[test]
    fn mkstat_round_trips_through_the_c_decoders() {
        let packed = lwp_mkstat(1, 300);
        assert_eq!(lwp_state(packed), 1);
        assert_eq!(lwp_termstat(packed), (300i32 & 0xFF));
    }

    #[test]
    fn mkstat_live_state_decodes_to_zero() {
        let packed = lwp_mkstat(0, 0);
        assert_eq!(lwp_state(packed), 0);
    }

    #[test]
    fn unknown_tid_has_no_thread_handle() {
        assert!(tid2thread(NO_THREAD).is_null());
        assert!(tid2thread(999_999).is_null());
    }

    #[test]
    fn set_scheduler_null_clears_the_cached_vtable() {
        static VTABLE: LwpSchedulerVtable = LwpSchedulerVtable {
            init: None,
            shutdown: None,
            admit: noop_admit,
            remove: noop_remove,
            next: no_thread_next,
            qlen: None,
        };
        unsafe {
            lwp_set_scheduler(&VTABLE);
            assert_eq!(lwp_get_scheduler(), &VTABLE as *const _);
            lwp_set_scheduler(ptr::null());
        }
        assert!(lwp_get_scheduler().is_null());
    }
}
