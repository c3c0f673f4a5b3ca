// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! End-to-end scenarios exercising `create`/`start`/`yield_now`/`exit`/
//! `wait` together, one scenario per test. Each test gets its own OS
//! thread from the default test harness, so each has its own
//! completely independent LWP scheduling domain: nothing here needs
//! to reset any state between tests.

use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static TRACE: RefCell<Vec<i32>> = RefCell::new(Vec::new());
}

fn trace(id: i32) {
    TRACE.with(|t| t.borrow_mut().push(id));
}

fn take_trace() -> Vec<i32> {
    TRACE.with(|t| std::mem::take(&mut *t.borrow_mut()))
}

/// Two workers print their argument three times apiece, yielding
/// between each print. Round-robin fairness guarantees their prints
/// strictly alternate no matter how many other threads (here, the
/// synthesized caller of `start`) share the ready queue between them.
#[test]
fn s1_two_yielding_workers_interleave_and_reap_in_creation_order() {
    extern "C" fn worker(arg: *mut u8) -> i32 {
        let id = arg as usize as i32;
        for _ in 0..3 {
            trace(id);
            lwp::yield_now();
        }
        id
    }

    let a = lwp::create(worker, 1 as *mut u8, 0);
    let b = lwp::create(worker, 2 as *mut u8, 0);
    lwp::start();

    assert_eq!(take_trace(), vec![1, 2, 1, 2, 1, 2]);

    let mut codes = HashMap::new();
    for _ in 0..2 {
        let mut status = lwp::ThreadStatus::new(lwp::ThreadState::Live, 0);
        let tid = lwp::wait(Some(&mut status));
        assert_ne!(tid, lwp::NO_THREAD);
        codes.insert(tid, status.exit_code());
    }
    assert_eq!(codes.get(&a), Some(&1));
    assert_eq!(codes.get(&b), Some(&2));
    assert_eq!(lwp::wait(None), lwp::NO_THREAD);
}

/// Three workers each exit with a distinct code; a fourth "reaper"
/// thread calls `wait` in a loop until it observes `NO_THREAD`.
///
/// The reaper's final `wait` call, the one that must return
/// `NO_THREAD`, happens once the only other thread this OS thread
/// knows about is the descriptor synthesized for `start`'s own
/// caller. That descriptor never exits, so a liveness check that
/// mistakes it for a real, possibly-still-running thread would block
/// the reaper there forever instead: `start()` itself would still
/// return (nothing keeps it from reaching its own "nothing left
/// ready" exit), silently leaving the reaper parked and its loop
/// never finishing. `REAPER_FINISHED` below is what actually catches
/// that: it is only set after the loop observes `NO_THREAD` and
/// returns, so a parked reaper fails this test instead of a
/// stall being mistaken for success.
#[test]
fn s2_reaper_drains_every_worker_with_correct_statuses() {
    thread_local! {
        static REAPS: RefCell<Vec<u8>> = RefCell::new(Vec::new());
        static REAPER_FINISHED: RefCell<bool> = RefCell::new(false);
    }

    extern "C" fn worker(arg: *mut u8) -> i32 {
        let i = arg as usize as i32;
        lwp::exit(40 + i)
    }

    extern "C" fn reaper(_arg: *mut u8) -> i32 {
        loop {
            let mut status = lwp::ThreadStatus::new(lwp::ThreadState::Live, 0);
            let tid = lwp::wait(Some(&mut status));
            if tid == lwp::NO_THREAD {
                break;
            }
            REAPS.with(|r| r.borrow_mut().push(status.exit_code()));
        }
        REAPER_FINISHED.with(|f| *f.borrow_mut() = true);
        0
    }

    for i in 1..=3 {
        lwp::create(worker, i as usize as *mut u8, 0);
    }
    lwp::create(reaper, std::ptr::null_mut(), 0);
    lwp::start();

    assert!(
        REAPER_FINISHED.with(|f| *f.borrow()),
        "reaper must observe NO_THREAD and return, not stall forever \
         waiting on the synthesized `start`-caller descriptor"
    );

    REAPS.with(|r| {
        let mut codes = r.borrow().clone();
        codes.sort_unstable();
        assert_eq!(codes, vec![41, 42, 43]);
    });
}

/// Five workers each stamp a private 4 KiB stack buffer with a
/// distinct byte, yield, and check the buffer survived the round
/// trip: proof that each thread's stack is its own.
#[test]
fn s3_stacks_are_isolated_across_yields() {
    extern "C" fn worker(arg: *mut u8) -> i32 {
        let id = arg as usize as u8;
        let mut buf = [0u8; 4096];
        for b in buf.iter_mut() {
            *b = id;
        }
        lwp::yield_now();
        if buf.iter().all(|&b| b == id) {
            0
        } else {
            1
        }
    }

    for i in 1..=5u8 {
        lwp::create(worker, i as usize as *mut u8, 0);
    }
    lwp::start();

    for _ in 0..5 {
        let mut status = lwp::ThreadStatus::new(lwp::ThreadState::Live, 0);
        let tid = lwp::wait(Some(&mut status));
        assert_ne!(tid, lwp::NO_THREAD);
        assert_eq!(status.exit_code(), 0, "tid {tid} observed stack corruption");
    }
}

/// After four workers are admitted (but before any of them has run),
/// swapping in a scheduler with a different policy must migrate every
/// admitted thread, and the new policy must actually govern
/// subsequent scheduling decisions.
#[test]
fn s4_scheduler_swap_migrates_every_ready_thread() {
    struct Lifo {
        ready: Vec<lwp::ThreadHandle>,
    }

    impl lwp::Scheduler for Lifo {
        fn admit(&mut self, thread: lwp::ThreadHandle) {
            self.ready.push(thread);
        }

        fn remove(&mut self, thread: lwp::ThreadHandle) {
            self.ready.retain(|&t| t != thread);
        }

        fn next(&mut self) -> lwp::ThreadHandle {
            self.ready.pop().unwrap_or(std::ptr::null_mut())
        }

        fn qlen(&self) -> usize {
            self.ready.len()
        }
    }

    extern "C" fn worker(arg: *mut u8) -> i32 {
        let id = arg as usize as i32;
        trace(id);
        for _ in 0..10 {
            lwp::yield_now();
        }
        0
    }

    let mut tids = Vec::new();
    for i in 1..=4 {
        tids.push(lwp::create(worker, i as usize as *mut u8, 0));
    }
    assert_eq!(lwp::scheduler_qlen(), 4);

    lwp::set_scheduler(Some(Lifo { ready: Vec::new() }));
    assert_eq!(lwp::scheduler_qlen(), 4, "swap must preserve the ready set");

    lwp::start();

    // The outgoing FIFO scheduler is drained in admission order (1,
    // 2, 3, 4) and each is pushed onto the incoming LIFO in that same
    // order, so the LIFO pops thread 4 first: the run order is the
    // reverse of admission order.
    assert_eq!(take_trace().first(), Some(&4));

    for _ in 0..4 {
        let tid = lwp::wait(None);
        assert_ne!(tid, lwp::NO_THREAD);
        assert!(tids.contains(&tid));
    }
    assert_eq!(lwp::wait(None), lwp::NO_THREAD);
}

/// A worker that falls off the end of its entry function and one
/// that calls `exit` explicitly are both reaped with their own code.
#[test]
fn s5_fall_off_end_and_explicit_exit_both_report_their_code() {
    extern "C" fn returns_seven(_arg: *mut u8) -> i32 {
        7
    }
    extern "C" fn exits_nine(_arg: *mut u8) -> i32 {
        lwp::exit(9)
    }

    let x = lwp::create(returns_seven, std::ptr::null_mut(), 0);
    let y = lwp::create(exits_nine, std::ptr::null_mut(), 0);
    lwp::start();

    let mut codes = HashMap::new();
    for _ in 0..2 {
        let mut status = lwp::ThreadStatus::new(lwp::ThreadState::Live, 0);
        let tid = lwp::wait(Some(&mut status));
        assert_ne!(tid, lwp::NO_THREAD);
        codes.insert(tid, status.exit_code());
    }
    assert_eq!(codes.get(&x), Some(&7));
    assert_eq!(codes.get(&y), Some(&9));
}

/// The TID counter never reclaims a reaped thread's identifier: a
/// thread created after three prior threads have all been reaped
/// still gets a TID none of those three ever held.
#[test]
fn s6_tids_are_never_reused_after_reap() {
    extern "C" fn noop(_arg: *mut u8) -> i32 {
        0
    }

    let t1 = lwp::create(noop, std::ptr::null_mut(), 0);
    let t2 = lwp::create(noop, std::ptr::null_mut(), 0);
    let t3 = lwp::create(noop, std::ptr::null_mut(), 0);
    lwp::start();

    for _ in 0..3 {
        assert_ne!(lwp::wait(None), lwp::NO_THREAD);
    }

    let t4 = lwp::create(noop, std::ptr::null_mut(), 0);
    assert!(![t1, t2, t3].contains(&t4));
    assert!(t4 > t3);

    lwp::start();
    assert_ne!(lwp::wait(None), lwp::NO_THREAD);
}
