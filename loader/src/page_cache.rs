// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use exec_parser::VirtualAddress;
use hashbrown::HashSet;

/// The set of pages that have been materialized so far.
///
/// Entries are page-aligned addresses and are never removed. The fault handler records into
/// the cache, so capacity has to be reserved up front with [`PageCache::reserve`].
#[derive(Debug)]
pub struct PageCache {
    page_size: usize,
    pages: HashSet<VirtualAddress>,
}

impl PageCache {
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two());

        Self {
            page_size,
            pages: HashSet::new(),
        }
    }

    /// Makes sure `additional` more pages can be recorded without allocating.
    pub fn reserve(&mut self, additional: usize) {
        self.pages.reserve(additional);
    }

    /// Marks the page containing `addr` as materialized.
    ///
    /// Returns `false` if the page was already recorded.
    pub fn record(&mut self, addr: VirtualAddress) -> bool {
        self.pages.insert(addr.align_down(self.page_size))
    }

    /// Returns `true` if the page containing `addr` has been materialized.
    #[must_use]
    pub fn is_materialized(&self, addr: VirtualAddress) -> bool {
        self.pages.contains(&addr.align_down(self.page_size))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pages.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_is_idempotent() {
        let mut cache = PageCache::new(4096);

        assert!(cache.record(VirtualAddress::new(0x40_0000)));
        assert!(!cache.record(VirtualAddress::new(0x40_0000)));
        assert!(!cache.record(VirtualAddress::new(0x40_0123)));

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unaligned_record_aligns_down() {
        let mut cache = PageCache::new(4096);

        cache.record(VirtualAddress::new(0x40_0fff));

        assert!(cache.is_materialized(VirtualAddress::new(0x40_0000)));
        assert!(!cache.is_materialized(VirtualAddress::new(0x40_1000)));
        assert!(!cache.is_materialized(VirtualAddress::new(0x3f_ffff)));
    }

    #[test]
    fn reserve_avoids_growth() {
        let mut cache = PageCache::new(4096);
        cache.reserve(64);
        let capacity = cache.capacity();

        for i in 0..64 {
            cache.record(VirtualAddress::new(i * 4096));
        }

        assert_eq!(cache.capacity(), capacity);
        assert_eq!(cache.len(), 64);
    }

    proptest! {
        #[test]
        fn any_byte_in_recorded_page(page in 0usize..(1 << 40), offset in 0usize..4096) {
            let mut cache = PageCache::new(4096);
            let page = VirtualAddress::new(page).align_down(4096);
            cache.record(page);

            let addr = page.checked_add(offset).unwrap();
            prop_assert!(cache.is_materialized(addr));
            prop_assert!(!cache.is_materialized(page.checked_add(4096).unwrap()));
        }
    }
}
