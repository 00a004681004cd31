// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin wrappers around the platform primitives the loader needs.
//!
//! Everything reachable from the fault handler (`map_fixed_rw`, `protect`, `write_stderr`,
//! `exit`) is a single async-signal-safe system call and never allocates. These functions don't
//! consult `errno` either: it lives in thread-local storage, which belongs to the loaded program
//! once it runs.

use core::ffi::{c_int, c_void};
use core::ops::Range;
use core::{mem, ptr};
use exec_parser::{AddressRangeExt, Permissions, VirtualAddress};
use std::io;
use std::os::fd::RawFd;

// `si_code` values for `SIGSEGV` (Linux `asm-generic/siginfo.h`); the `libc` crate doesn't export them for Linux.
pub const SEGV_MAPERR: c_int = 1;
pub const SEGV_ACCERR: c_int = 2;

/// A system call on the fault path failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFailed(pub &'static str);

pub type SignalHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

pub fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).unwrap_or(0);
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Translates segment permissions into `PROT_*` bits.
pub fn prot_flags(permissions: Permissions) -> c_int {
    let mut prot = libc::PROT_NONE;
    if permissions.contains(Permissions::READ) {
        prot |= libc::PROT_READ;
    }
    if permissions.contains(Permissions::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if permissions.contains(Permissions::EXECUTE) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Claims `range` with an inaccessible mapping, failing if any part of it is already mapped.
pub fn reserve(range: &Range<VirtualAddress>) -> io::Result<()> {
    // Safety: MAP_FIXED_NOREPLACE never replaces existing mappings
    let addr = unsafe {
        libc::mmap(
            range.start.as_mut_ptr().cast(),
            range.len(),
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    // kernels before 4.17 treat MAP_FIXED_NOREPLACE as a hint
    if addr.cast::<u8>() != range.start.as_mut_ptr() {
        // Safety: `addr` is the mapping we just created
        unsafe {
            libc::munmap(addr, range.len());
        }
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }

    Ok(())
}

/// Removes all mappings in `range`.
pub fn release(range: &Range<VirtualAddress>) -> io::Result<()> {
    // Safety: callers only release ranges they reserved themselves
    let ret = unsafe { libc::munmap(range.start.as_mut_ptr().cast(), range.len()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Replaces whatever is mapped at `page..page + len` with fresh, zeroed, read-write memory.
pub fn map_fixed_rw(page: VirtualAddress, len: usize) -> Result<(), CallFailed> {
    // Safety: the caller owns the range, it is part of a reservation
    let addr = unsafe {
        libc::mmap(
            page.as_mut_ptr().cast(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(CallFailed("mmap"));
    }
    Ok(())
}

pub fn protect(page: VirtualAddress, len: usize, permissions: Permissions) -> Result<(), CallFailed> {
    // Safety: the caller owns the range
    let ret = unsafe { libc::mprotect(page.as_mut_ptr().cast(), len, prot_flags(permissions)) };
    if ret != 0 {
        return Err(CallFailed("mprotect"));
    }
    Ok(())
}

/// Positioned read from `fd` that reports failure without consulting `errno`.
pub fn pread(fd: RawFd, buf: &mut [u8], pos: u64) -> Result<usize, CallFailed> {
    let offset = libc::off_t::try_from(pos).map_err(|_| CallFailed("pread"))?;

    // Safety: the destination is `buf`, valid for `buf.len()` bytes
    let ret = unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset) };
    usize::try_from(ret).map_err(|_| CallFailed("pread"))
}

/// Installs `handler` for `SIGSEGV`.
///
/// `SA_NODEFER` is not set, so a fault raised while the handler runs is not delivered
/// recursively.
pub fn install_fault_handler(handler: SignalHandler) -> io::Result<()> {
    // Safety: all-zero is a valid `sigaction`
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO;

    // Safety: `action` is a valid, initialized sigaction struct
    let ret = unsafe {
        libc::sigemptyset(&raw mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &raw const action, ptr::null_mut())
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Writes all of `bytes` to stderr, giving up silently on error.
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // Safety: `bytes` is a valid buffer of the given length
        let ret = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        match usize::try_from(ret) {
            Ok(0) | Err(_) => return,
            Ok(n) => bytes = &bytes[n..],
        }
    }
}

pub fn stderr_is_terminal() -> bool {
    // Safety: isatty has no preconditions
    unsafe { libc::isatty(libc::STDERR_FILENO) == 1 }
}

/// Terminates the process immediately, without running destructors or atexit handlers.
pub fn exit(code: i32) -> ! {
    // Safety: _exit has no preconditions
    unsafe { libc::_exit(code) }
}
