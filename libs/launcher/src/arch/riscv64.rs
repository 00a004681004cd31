// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::arch::asm;

/// Switches to `stack` and jumps to `entry`.
///
/// `a0` carries the `atexit` function pointer expected by the program's startup code, we
/// pass null.
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
            "mv sp, a1",
            "mv a0, zero",
            "mv ra, zero", // Reset return address
            "mv s0, zero",
            "jalr zero, a2",
            in("a1") stack,
            in("a2") entry,
            options(noreturn)
        }
    }
}
