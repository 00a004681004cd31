// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sys::{self, CallFailed};
use core::ops::Range;
use core::ptr;
use exec_parser::{AddressRangeExt, Segment, VirtualAddress};
use std::fs::File;
use std::os::fd::AsRawFd;

/// Populates the page at `page` with its content from `segment` and applies the segment's
/// permissions.
///
/// `scratch` must be exactly one page long. The page content is assembled in `scratch` first,
/// the page is then mapped read-write, filled and finally downgraded, so content is always
/// written before read-only or executable permissions take effect.
///
/// # Errors
///
/// Returns an error if mapping the page or changing its permissions fails. Errors reading the
/// backing file are not reported, the affected bytes read as zero.
pub fn materialize(
    segment: &Segment,
    page: VirtualAddress,
    file: &File,
    scratch: &mut [u8],
) -> Result<(), CallFailed> {
    let page_size = scratch.len();
    debug_assert!(page.is_aligned_to(page_size));

    fill_page(segment, page, file, scratch);

    sys::map_fixed_rw(page, page_size)?;
    // Safety: the page was just mapped read-write and is exactly `page_size` bytes long
    unsafe {
        ptr::copy_nonoverlapping(scratch.as_ptr(), page.as_mut_ptr(), page_size);
    }
    sys::protect(page, page_size, segment.permissions)?;

    log::trace!(
        "materialized page {page} ({}) of segment {}",
        segment.permissions,
        segment.virtual_base
    );

    Ok(())
}

/// Assembles the content of `page` into `scratch` and returns the number of bytes read from
/// `file`.
///
/// Bytes of the page that fall into the segment's file-backed range are read from `file`,
/// everything else (bss tail, bytes below an unaligned segment base, bytes missing from a
/// truncated file) is zeroed.
pub fn fill_page(segment: &Segment, page: VirtualAddress, file: &File, scratch: &mut [u8]) -> usize {
    let window = file_window(segment, page, scratch.len());
    // an empty window may begin anywhere, normalize it to the page start
    let start = if window.is_empty() {
        0
    } else {
        window.start.checked_sub_addr(page).unwrap_or(0)
    };
    let len = window.len();

    let mut read = 0;
    if len > 0 {
        let relative = window
            .start
            .checked_sub_addr(segment.virtual_base)
            .and_then(|offset| u64::try_from(offset).ok());

        match relative.and_then(|offset| segment.file_offset.checked_add(offset)) {
            Some(pos) => read = read_full(file, &mut scratch[start..start + len], pos),
            None => log::warn!("file position of page {page} is out of range"),
        }

        if read < len {
            log::warn!(
                "short read for page {page}: expected {len:#x} bytes, got {read:#x}, zero-filling the rest"
            );
        }
    }

    scratch[..start].fill(0);
    scratch[start + read..].fill(0);

    read
}

/// The part of `page` that is backed by file content.
fn file_window(segment: &Segment, page: VirtualAddress, page_size: usize) -> Range<VirtualAddress> {
    let page_end = page.checked_add(page_size).unwrap_or(VirtualAddress::MAX);
    segment.file_backed_range().intersect(&(page..page_end))
}

/// Reads into `buf` starting at file position `pos` until `buf` is full, the end of the file
/// is reached or a read fails. Returns the number of bytes read.
///
/// Reads of regular files are not interrupted by signals, so any failure ends the read.
fn read_full(file: &File, buf: &mut [u8], mut pos: u64) -> usize {
    let fd = file.as_raw_fd();
    let mut filled = 0;

    while filled < buf.len() {
        match sys::pread(fd, &mut buf[filled..], pos) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                pos = pos.saturating_add(u64::try_from(n).unwrap_or(u64::MAX));
            }
            Err(CallFailed(call)) => {
                log::warn!("{call} of backing file at {pos:#x} failed");
                break;
            }
        }
    }

    filled
}
