// Copyright 2021 The LWP Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The register-level context switch primitive and the trampoline a
//! freshly created thread lands in on its first resumption.
//!
//! Implemented once, for x86_64 System V, following the same
//! `global_asm!` + `extern "sysv64"` pattern the teacher uses for its
//! own kernel-thread switch routine. There is no portable fallback:
//! a build for any other architecture fails at compile time rather
//! than silently linking against a routine that would corrupt the
//! first thread it ever switched to.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("lwp's context switch primitive is implemented for x86_64 only");

use std::arch::global_asm;

use crate::stack::Stack;

global_asm!(include_str!("swap_x86_64.s"));

extern "sysv64" {
    /// Saves the caller's callee-saved registers and FPU/SSE state into
    /// `*old` (skipped entirely if `old` is null), then loads the same
    /// from `*new` and returns into whatever instruction pointer is
    /// recorded there (skipped if `new` is null, in which case this
    /// simply returns to the caller having only saved state).
    ///
    /// Both pointers may be null; `old == new == null` has no effect at
    /// all. Never called directly outside this module: see
    /// [`switch`].
    fn swap_rfiles(old: *mut RegisterFile, new: *const RegisterFile);
}

/// The FPU/SSE state block saved and restored by `fxsave`/`fxrstor`:
/// 512 bytes, 16-byte aligned.
type FxSave = [u8; 512];

/// Returns an `fxsave` image in the processor's post-reset state:
/// the default control word (`0x037F`) and the default MXCSR
/// (`0x1F80`), all other bytes zero. A freshly created thread starts
/// with this rather than whatever the FPU happened to contain when
/// `create` was called.
fn blank_fpu_state() -> FxSave {
    let mut image = [0u8; 512];
    image[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
    image[24..28].copy_from_slice(&0x0000_1F80u32.to_le_bytes());
    image
}

/// The callee-saved register set a thread carries between
/// [`switch`] calls.
///
/// `rbp` has no field here: it is preserved on the thread's own stack
/// (pushed immediately before `rsp` is captured, popped immediately
/// before control returns), not in this struct. See
/// `swap_x86_64.s` for the full accounting.
///
/// The field order and size are load-bearing: `swap_rfiles` addresses
/// every field but `fxsave` by a hardcoded byte offset from the start
/// of this struct.
#[repr(C, align(16))]
pub struct RegisterFile {
    rsp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rdi: u64,
    rsi: u64,
    fxsave: FxSave,
}

/// The signature every lwp entry point has: a single untyped argument
/// pointer in, an exit code out.
pub type EntryFn = extern "C" fn(*mut u8) -> i32;

impl RegisterFile {
    /// Builds the register file for a thread that has not run yet.
    ///
    /// Writes a synthetic two-word initial frame at the top of
    /// `stack`: a fake saved base pointer (zero) followed by the
    /// address of [`trampoline`], so that the context switch's own
    /// `pop %rbp; ret` sequence, on this thread's first resumption,
    /// lands in the trampoline exactly as it would land back in an
    /// ordinary caller on any later resumption.
    ///
    /// # Safety
    ///
    /// `stack` must not be in use by any other thread, and must
    /// outlive every future [`switch`] that resumes the returned
    /// register file.
    pub unsafe fn for_new_thread(stack: &Stack, entry: EntryFn, argument: *mut u8) -> RegisterFile {
        let top = stack.top() as usize;
        let aligned_top = top & !0xF;
        let frame_base = (aligned_top - 24) as *mut u64;

        frame_base.write(0);
        frame_base.add(1).write(trampoline as usize as u64);
        frame_base.add(2).write(0);

        RegisterFile {
            rsp: frame_base as u64,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rdi: entry as usize as u64,
            rsi: argument as u64,
            fxsave: blank_fpu_state(),
        }
    }

    /// An all-zero register file, never resumed into: a placeholder
    /// for the thread descriptor representing whichever OS thread
    /// called `start`, which is saved into but never restored from
    /// (there being no "before `start`" to go back to).
    pub fn blank() -> RegisterFile {
        RegisterFile {
            rsp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rdi: 0,
            rsi: 0,
            fxsave: blank_fpu_state(),
        }
    }
}

/// Switches from `from` to `to`: saves the currently running thread's
/// register state into `from` and loads `to`'s, resuming execution
/// wherever `to` last left off (or, if `to` has never run, at its
/// trampoline).
///
/// Returns once some other call to `switch` names `from` as its `to`.
/// Callers must treat this exactly like an ordinary function call
/// with respect to the borrow checker: anything live across it on the
/// stack survives, but registers do not, by construction.
///
/// # Safety
///
/// `from` and `to` must each point at a valid, exclusively-owned
/// `RegisterFile`, and `to` must belong to a thread whose stack is
/// still mapped.
pub unsafe fn switch(from: *mut RegisterFile, to: *const RegisterFile) {
    swap_rfiles(from, to);
}

/// The landing point for a freshly created thread's first resumption.
///
/// Ordinary Rust calling convention: because [`RegisterFile::for_new_thread`]
/// loads `entry` into `rdi` and `argument` into `rsi` immediately
/// before the context switch's final `ret`, control arrives here
/// exactly as if `trampoline(entry, argument)` had been called
/// normally, with no hand-written prologue required.
extern "sysv64" fn trampoline(entry: EntryFn, argument: *mut u8) -> ! {
    let code = entry(argument);
    crate::runtime::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    /// `switch(from, to)` with `to == null` saves the caller's state
    /// and simply returns, rather than jumping anywhere: no crate call
    /// site exercises this branch (every switch names a real `to`),
    /// so this is the only coverage for `swap_rfiles`'s save-only path
    /// balancing its own `push %rbp` with a matching `pop` before
    /// returning to its real caller.
    #[test]
    fn switch_with_no_destination_returns_to_the_caller() {
        let mut discarded = RegisterFile::blank();
        unsafe {
            switch(&mut discarded as *mut RegisterFile, ptr::null());
        }
        // A corrupted stack from the missing `pop %rbp` would crash
        // or misbehave before this line is ever reached; the saved
        // `rsp` is proof the save half of the routine actually ran.
        assert_ne!(discarded.rsp, 0);
    }
}
