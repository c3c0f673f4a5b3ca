// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Allocates and releases the page-aligned memory regions backing
//! each thread's call stack.
//!
//! Sizing follows the process's stack `rlimit`, rounded up to a
//! multiple of the page size, with an 8 MiB floor when the limit is
//! unset or unbounded. This is a direct translation of the original
//! library's `get_stack_size`/`mmap`/`munmap` trio into the `libc`
//! crate, since the no_std teacher this crate otherwise follows
//! manages its own page tables and has no equivalent of raw
//! anonymous-mapping syscalls.

use std::io;
use std::ptr;

/// The default stack size used when the process has no stack
/// `rlimit` (or an unbounded one): 8 MiB.
///
const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// A page-aligned, anonymous memory region backing one thread's
/// stack.
///
/// The region is released when the `Stack` is dropped. `wait` is the
/// only place a `Stack` is ever dropped for a thread created via
/// [`crate::create`]; the `start`-synthesized thread has no `Stack`
/// at all, as it runs on the stack of the OS thread that called
/// `start`.
///
#[derive(Debug)]
pub struct Stack {
    base: *mut u8,
    size: usize,
}

// A Stack is only ever touched by the one OS thread that owns the
// lwp runtime it belongs to; the raw pointer carries no aliasing
// risk across threads because none occurs.
unsafe impl Send for Stack {}

impl Stack {
    /// Requests a stack of at least `hint` bytes (the caller's advisory
    /// size), the process's stack `rlimit`, or 8 MiB, whichever is
    /// largest, rounded up to a page multiple.
    ///
    pub fn allocate(hint: usize) -> io::Result<Stack> {
        let page_size = page_size();
        let size = round_up(hint.max(rlimit_stack_size()).max(DEFAULT_STACK_SIZE), page_size);

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | stack_growth_hint_flag(),
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Stack {
            base: addr as *mut u8,
            size,
        })
    }

    /// Returns a pointer to the highest address in the stack, the
    /// starting stack pointer for a freshly-constructed thread (the
    /// stack grows downwards from here).
    ///
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.size) }
    }

    /// Returns the size of the region in bytes.
    ///
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    let remainder = value % multiple;
    if remainder == 0 {
        value
    } else {
        value + (multiple - remainder)
    }
}

/// Reads `RLIMIT_STACK`, falling back to 0 (meaning "no opinion",
/// deferring to [`DEFAULT_STACK_SIZE`]) if the limit is unbounded or
/// the call fails, exactly as the original library does.
///
fn rlimit_stack_size() -> usize {
    let mut limits = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ok = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limits) == 0 };
    if ok && limits.rlim_cur != libc::RLIM_INFINITY && limits.rlim_cur != 0 {
        limits.rlim_cur as usize
    } else {
        0
    }
}

#[cfg(all(target_os = "linux"))]
fn stack_growth_hint_flag() -> libc::c_int {
    libc::MAP_STACK
}

#[cfg(not(target_os = "linux"))]
fn stack_growth_hint_flag() -> libc::c_int {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_at_least_the_default_size() {
        let stack = Stack::allocate(0).expect("stack allocation should succeed");
        assert!(stack.size() >= DEFAULT_STACK_SIZE);
    }

    #[test]
    fn honors_a_hint_larger_than_the_default() {
        let hint = DEFAULT_STACK_SIZE * 2;
        let stack = Stack::allocate(hint).expect("stack allocation should succeed");
        assert!(stack.size() >= hint);
    }

    #[test]
    fn size_is_page_aligned() {
        let stack = Stack::allocate(1).expect("stack allocation should succeed");
        assert_eq!(stack.size() % page_size(), 0);
    }

    #[test]
    fn top_is_base_plus_size() {
        let stack = Stack::allocate(0).expect("stack allocation should succeed");
        assert_eq!(stack.top() as usize, stack.base as usize + stack.size());
    }
}
