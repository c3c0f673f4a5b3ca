// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Three workers that each exit with a distinct code, and a fourth
//! "reaper" thread that calls `wait` in a loop until it sees
//! [`lwp::NO_THREAD`], reporting every status it reaped.

extern "C" fn worker(arg: *mut u8) -> i32 {
    let id = arg as usize as i32;
    println!("worker {id}: exiting with code {}", 40 + id);
    lwp::exit(40 + id);
}

extern "C" fn reaper(_arg: *mut u8) -> i32 {
    let mut reaped = 0;
    loop {
        let mut status = lwp::ThreadStatus::new(lwp::ThreadState::Live, 0);
        let tid = lwp::wait(Some(&mut status));
        if tid == lwp::NO_THREAD {
            break;
        }
        println!("reaper: tid {tid} exited with status {}", status.exit_code());
        reaped += 1;
    }
    println!("reaper: done, reaped {reaped} workers");
    0
}

fn main() {
    println!("starting lwp demo: reaper pattern");
    for i in 1..=3 {
        let tid = lwp::create(worker, i as *mut u8, 0);
        println!("created worker tid {tid} (arg {i})");
    }
    lwp::create(reaper, std::ptr::null_mut(), 0);
    lwp::start();
}
