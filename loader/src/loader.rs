// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::page_cache::PageCache;
use crate::sys;
use core::ops::Range;
use exec_parser::{AddressRangeExt, SegmentTable, VirtualAddress};
use spin::{Mutex, Once};
use std::fs::File;

/// The process-wide loader state.
///
/// Signal handlers receive no user data, so the fault handler finds the loader through this
/// global instead.
pub(crate) static LOADER: Once<Mutex<Loader>> = Once::new();

#[derive(Debug)]
pub struct Loader {
    page_size: usize,
    pages: PageCache,
    image: Option<Image>,
}

/// A program that is being loaded lazily.
#[derive(Debug)]
pub struct Image {
    pub segments: SegmentTable,
    pub file: File,
    /// One page worth of memory to assemble page contents in.
    pub scratch: Box<[u8]>,
}

impl Loader {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: PageCache::new(page_size),
            image: None,
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn pages(&self) -> &PageCache {
        &self.pages
    }

    #[must_use]
    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    /// Splits the state into the parts the fault handler needs to borrow independently.
    pub(crate) fn parts_mut(&mut self) -> (usize, &mut PageCache, Option<&mut Image>) {
        (self.page_size, &mut self.pages, self.image.as_mut())
    }

    /// Attaches `segments` backed by `file` as the image to load.
    ///
    /// Reserves page cache capacity for every page of every segment so that the fault handler
    /// never has to allocate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyLoaded`] if an image is already attached or
    /// [`Error::AddressOverflow`] if a segment's page range overflows the address space.
    pub fn attach(&mut self, segments: SegmentTable, file: File) -> Result<&Image, Error> {
        if self.image.is_some() {
            return Err(Error::AlreadyLoaded);
        }

        let mut pages = 0;
        for segment in &segments {
            let range = page_range(&segment.virt_range(), self.page_size)?;
            pages += range.len() / self.page_size;
        }
        self.pages.reserve(pages);

        log::debug!("attached image with {} segments spanning {pages} pages", segments.len());

        Ok(self.image.insert(Image {
            segments,
            file,
            scratch: vec![0; self.page_size].into_boxed_slice(),
        }))
    }
}

/// Returns `range` extended outwards to page boundaries.
///
/// # Errors
///
/// Returns [`Error::AddressOverflow`] if rounding up overflows the address space.
pub fn page_range(
    range: &Range<VirtualAddress>,
    page_size: usize,
) -> Result<Range<VirtualAddress>, Error> {
    let start = range.start.align_down(page_size);
    let end = range
        .end
        .checked_align_up(page_size)
        .ok_or(Error::AddressOverflow)?;
    Ok(start..end)
}

/// The page ranges covering every segment of `segments`, sorted and with overlapping or
/// adjacent ranges merged.
///
/// A page shared by two segments is reserved once but materialized from whichever segment the
/// first fault on it resolves to, with that segment's content and permissions. A later access
/// through the other segment faults on an already materialized page.
///
/// # Errors
///
/// Returns [`Error::AddressOverflow`] if a segment's page range overflows the address space.
pub fn reservation_ranges(
    segments: &SegmentTable,
    page_size: usize,
) -> Result<Vec<Range<VirtualAddress>>, Error> {
    let mut ranges = segments
        .iter()
        .map(|segment| page_range(&segment.virt_range(), page_size))
        .collect::<Result<Vec<_>, _>>()?;
    ranges.sort_unstable_by_key(|range| range.start);

    let mut merged: Vec<Range<VirtualAddress>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }

    Ok(merged)
}

/// Reserves the address space of every segment with inaccessible mappings and returns the
/// reserved ranges.
///
/// On failure every reservation made so far is released again.
///
/// # Errors
///
/// Returns [`Error::AddressInUse`] if part of a range is already mapped.
pub fn reserve_segments(
    segments: &SegmentTable,
    page_size: usize,
) -> Result<Vec<Range<VirtualAddress>>, Error> {
    let ranges = reservation_ranges(segments, page_size)?;

    for (i, range) in ranges.iter().enumerate() {
        if let Err(err) = sys::reserve(range) {
            release_reservations(&ranges[..i]);

            return if err.raw_os_error() == Some(libc::EEXIST) {
                Err(Error::AddressInUse(range.start, range.end))
            } else {
                Err(err.into())
            };
        }

        log::debug!("reserved {}..{}", range.start, range.end);
    }

    Ok(ranges)
}

/// Gives back ranges returned by [`reserve_segments`].
pub fn release_reservations(ranges: &[Range<VirtualAddress>]) {
    for range in ranges {
        if let Err(err) = sys::release(range) {
            log::warn!("failed to release reservation {}..{}: {err}", range.start, range.end);
        }
    }
}
