// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The default scheduling policy: a plain FIFO ready queue.

use std::ptr;

use super::Scheduler;
use crate::status::ThreadState;
use crate::thread::{handle_of, tcb_of, ThreadControlBlock, ThreadHandle};

/// Runs admitted threads in the order they became runnable, cycling
/// back to the front once every thread has had a turn. Equivalent to
/// the original library's built-in round-robin policy, a doubly
/// linked queue threaded through each thread's scheduler-private
/// link slots so that [`Scheduler::remove`] can detach an arbitrary
/// thread in constant time.
pub struct RoundRobin {
    head: *mut ThreadControlBlock,
    tail: *mut ThreadControlBlock,
    len: usize,
}

impl RoundRobin {
    pub const fn new() -> RoundRobin {
        RoundRobin {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }
}

impl Default for RoundRobin {
    fn default() -> RoundRobin {
        RoundRobin::new()
    }
}

impl RoundRobin {
    fn remove_tcb(&mut self, thread: *mut ThreadControlBlock) {
        let prev = unsafe { (*thread).sched_prev.get() };
        let next = unsafe { (*thread).sched_next.get() };

        if prev.is_null() {
            self.head = next;
        } else {
            unsafe { (*prev).sched_next.set(next) };
        }
        if next.is_null() {
            self.tail = prev;
        } else {
            unsafe { (*next).sched_prev.set(prev) };
        }

        unsafe {
            (*thread).sched_prev.set(ptr::null_mut());
            (*thread).sched_next.set(ptr::null_mut());
        }
        self.len -= 1;
    }
}

impl Scheduler for RoundRobin {
    fn admit(&mut self, thread: ThreadHandle) {
        let thread = tcb_of(thread);
        if unsafe { (*thread).status.get().state() } != ThreadState::Live {
            return;
        }
        unsafe {
            (*thread).sched_prev.set(self.tail);
            (*thread).sched_next.set(ptr::null_mut());
        }
        if self.tail.is_null() {
            self.head = thread;
        } else {
            unsafe { (*self.tail).sched_next.set(thread) };
        }
        self.tail = thread;
        self.len += 1;
    }

    fn remove(&mut self, thread: ThreadHandle) {
        self.remove_tcb(tcb_of(thread));
    }

    fn next(&mut self) -> ThreadHandle {
        loop {
            if self.head.is_null() {
                return ptr::null_mut();
            }
            let front = self.head;
            self.remove_tcb(front);
            // Safety net: a conforming caller never admits a non-LIVE
            // thread, but a thread can still terminate without ever
            // being removed from this queue (it simply never is
            // admitted again), so this never actually fires in this
            // crate. A third-party scheduler sharing this queue's
            // discipline gets the same protection spec.md calls for.
            if unsafe { (*front).status.get().state() } == ThreadState::Live {
                return handle_of(front);
            }
        }
    }

    fn qlen(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ThreadState, ThreadStatus};
    use std::cell::{Cell, UnsafeCell};

    fn fake_thread(tid: u64) -> Box<ThreadControlBlock> {
        Box::new(ThreadControlBlock {
            tid,
            registers: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            stack: None,
            status: Cell::new(ThreadStatus::new(ThreadState::Live, 0)),
            all_link: Cell::new(ptr::null_mut()),
            queue_link: Cell::new(ptr::null_mut()),
            sched_prev: Cell::new(ptr::null_mut()),
            sched_next: Cell::new(ptr::null_mut()),
            is_original: false,
        })
    }

    #[test]
    fn admits_and_returns_in_fifo_order() {
        let a = Box::into_raw(fake_thread(1));
        let b = Box::into_raw(fake_thread(2));
        let c = Box::into_raw(fake_thread(3));

        let mut rr = RoundRobin::new();
        rr.admit(handle_of(a));
        rr.admit(handle_of(b));
        rr.admit(handle_of(c));
        assert_eq!(rr.qlen(), 3);

        unsafe {
            assert_eq!((*tcb_of(rr.next())).tid, 1);
            assert_eq!((*tcb_of(rr.next())).tid, 2);
            assert_eq!((*tcb_of(rr.next())).tid, 3);
        }
        assert!(rr.next().is_null());

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
            drop(Box::from_raw(c));
        }
    }

    #[test]
    fn remove_detaches_from_the_middle() {
        let a = Box::into_raw(fake_thread(1));
        let b = Box::into_raw(fake_thread(2));
        let c = Box::into_raw(fake_thread(3));

        let mut rr = RoundRobin::new();
        rr.admit(handle_of(a));
        rr.admit(handle_of(b));
        rr.admit(handle_of(c));
        rr.remove(handle_of(b));
        assert_eq!(rr.qlen(), 2);

        unsafe {
            assert_eq!((*tcb_of(rr.next())).tid, 1);
            assert_eq!((*tcb_of(rr.next())).tid, 3);
        }

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
            drop(Box::from_raw(c));
        }
    }

    proptest::proptest! {
        #[test]
        fn every_admitted_thread_cycles_equally_often(n in 1usize..8, rounds in 1usize..6) {
            let threads: Vec<*mut ThreadControlBlock> =
                (0..n).map(|i| Box::into_raw(fake_thread(i as u64))).collect();

            let mut rr = RoundRobin::new();
            for &t in &threads {
                rr.admit(handle_of(t));
            }

            // Every thread re-admits itself the instant it is picked,
            // modeling a set of threads that do nothing but yield:
            // round-robin's fairness bound (spec.md's invariant that a
            // thread yielding N times sees every other ready thread run
            // at least floor(N / ready-count) times) holds with equality
            // here, since nothing ever leaves the ready set early.
            let mut counts = vec![0usize; n];
            for _ in 0..(n * rounds) {
                let next = tcb_of(rr.next());
                proptest::prop_assert!(!next.is_null());
                let tid = unsafe { (*next).tid } as usize;
                counts[tid] += 1;
                rr.admit(handle_of(next));
            }

            for c in &counts {
                proptest::prop_assert_eq!(*c, rounds);
            }

            for t in threads {
                unsafe { drop(Box::from_raw(t)) };
            }
        }
    }
}
