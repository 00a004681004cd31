// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Error;
use std::ffi::CStr;
use std::io;
use std::ptr;

/// An eagerly mapped, downward growing stack for the launched program.
///
/// The lowest page is left inaccessible as a guard page. The mapping is never unmapped: once
/// control is transferred the stack belongs to the program for the rest of the process'
/// lifetime.
pub struct InitialStack {
    bottom: usize,
    sp: usize,
}

impl InitialStack {
    /// Maps a new stack of `size` bytes (rounded up to whole pages) plus a guard page.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping can't be created.
    pub fn new(size: usize, page_size: usize) -> Result<Self, Error> {
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .ok_or(Error::StackExhausted)?
            & !(page_size - 1);

        // Safety: we ask for a fresh anonymous mapping anywhere in the address space
        let mmap = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if mmap == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        let base = mmap.expose_provenance();

        // Safety: the range lies inside the mapping we just created, skipping the guard page
        let ret = unsafe {
            libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }

        log::trace!(
            "mapped initial stack {:#x}..{:#x}",
            base + page_size,
            base + mmap_len
        );

        Ok(Self {
            bottom: base + page_size,
            sp: base + mmap_len,
        })
    }

    /// Returns the current stack pointer.
    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Aligns the stack pointer down to `align` bytes.
    pub fn align(&mut self, align: usize) {
        debug_assert!(align.is_power_of_two());
        self.sp &= !(align - 1);
    }

    /// Pushes raw bytes onto the stack, returning the address they were written to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackExhausted`] if the bytes would reach into the guard page.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        let sp = self
            .sp
            .checked_sub(bytes.len())
            .filter(|sp| *sp >= self.bottom)
            .ok_or(Error::StackExhausted)?;

        // Safety: `sp..sp + bytes.len()` lies within the read-write part of our mapping
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ptr::with_exposed_provenance_mut(sp),
                bytes.len(),
            );
        }

        self.sp = sp;
        Ok(sp)
    }

    /// Pushes a native endian word.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackExhausted`] if the stack is full.
    pub fn push_usize(&mut self, v: usize) -> Result<usize, Error> {
        self.push_bytes(&v.to_ne_bytes())
    }

    /// Pushes a NUL terminated string, returning its address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackExhausted`] if the stack is full.
    pub fn push_cstr(&mut self, s: &CStr) -> Result<usize, Error> {
        self.push_bytes(s.to_bytes_with_nul())
    }

    /// Consumes the builder and leaks the mapping, returning the final stack pointer.
    pub fn finish(self) -> usize {
        self.sp
    }
}
