// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::arch::asm;

/// Switches to `stack` and jumps to `entry`.
///
/// Per the System V ABI `rdx` holds a function pointer the program registers with `atexit`,
/// we pass null. The frame pointer is cleared to mark the outermost frame.
///
/// # Safety
///
/// `stack` must point to a valid initial process stack and `entry` to the entry point of a
/// program that has been set up to run in this address space.
pub unsafe fn jump_to_entry(stack: usize, entry: usize) -> ! {
    log::trace!("jumping to entry {entry:#x} with sp={stack:#x}");

    // Safety: ensured by caller
    unsafe {
        asm! {
            "mov rsp, rsi",
            "xor ebp, ebp",
            "xor edx, edx",
            "xor eax, eax",
            "jmp rdi",
            in("rsi") stack,
            in("rdi") entry,
            options(noreturn)
        }
    }
}
