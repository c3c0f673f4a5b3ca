// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Two workers that print their argument three times, yielding
//! between each print, then return it as their exit code. A third
//! "reaper" loop waits for both and reports what it found.
//!
//! Translated from the original library's own `main.c` harness.

extern "C" fn worker(arg: *mut u8) -> i32 {
    let id = arg as usize as i32;
    for _ in 0..3 {
        println!("worker {id}: {id}");
        lwp::yield_now();
    }
    id
}

fn main() {
    println!("starting lwp demo: two yielding workers");

    let a = lwp::create(worker, 1 as *mut u8, 0);
    let b = lwp::create(worker, 2 as *mut u8, 0);
    println!("created tid {a} (arg 1) and tid {b} (arg 2)");

    extern "C" fn reaper(_arg: *mut u8) -> i32 {
        let mut completed = 0;
        while completed < 2 {
            let mut status = lwp::ThreadStatus::new(lwp::ThreadState::Live, 0);
            let tid = lwp::wait(Some(&mut status));
            if tid == lwp::NO_THREAD {
                lwp::yield_now();
                continue;
            }
            println!("reaped tid {tid} with exit code {}", status.exit_code());
            completed += 1;
        }
        0
    }
    lwp::create(reaper, std::ptr::null_mut(), 0);

    lwp::start();
    println!("all workers reaped, exiting");
}
