// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Range;

/// A virtual address inside the loaded program's address space.
///
/// All arithmetic on addresses is explicit. Operations that may leave the address space
/// (`checked_add`, `checked_sub_addr`) return `None` instead of wrapping.
#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    pub const MAX: Self = Self(usize::MAX);
    pub const MIN: Self = Self(usize::MIN);

    #[must_use]
    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    #[inline]
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    #[must_use]
    #[inline]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.expose_provenance())
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *const u8 {
        core::ptr::with_exposed_provenance(self.0)
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr(self) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.0)
    }

    /// Adds an unsigned offset to this address, returning `None` if overflow occurred.
    #[must_use]
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Calculates the distance in bytes from `origin` up to `self`.
    ///
    /// Returns `None` if `self` lies below `origin`.
    #[must_use]
    #[inline]
    pub const fn checked_sub_addr(self, origin: Self) -> Option<usize> {
        self.0.checked_sub(origin.0)
    }

    #[must_use]
    #[inline]
    pub const fn is_aligned_to(&self, align: usize) -> bool {
        assert!(
            align.is_power_of_two(),
            "is_aligned_to: align is not a power-of-two"
        );

        self.0 & (align - 1) == 0
    }

    /// Rounds this address down to the closest multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(
            align.is_power_of_two(),
            "align_down: align is not a power-of-two"
        );

        Self(self.0 & 0usize.wrapping_sub(align))
    }

    /// Rounds this address up to the closest multiple of `align`, returning `None` if that
    /// would overflow the address space.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn checked_align_up(self, align: usize) -> Option<Self> {
        assert!(
            align.is_power_of_two(),
            "checked_align_up: align is not a power-of-two"
        );

        match self.0.checked_add(align - 1) {
            Some(n) => Some(Self(n & 0usize.wrapping_sub(align))),
            None => None,
        }
    }
}

impl From<usize> for VirtualAddress {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl TryFrom<u64> for VirtualAddress {
    type Error = <usize as TryFrom<u64>>::Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        usize::try_from(value).map(VirtualAddress)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VirtualAddress")
            .field(&format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
            .finish()
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

pub trait AddressRangeExt {
    /// Returns the length of the address range, in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if there exists an address present in both ranges.
    fn overlaps(&self, other: &Self) -> bool;

    /// Returns the intersection of `self` and `other`, which is empty if they don't overlap.
    #[must_use]
    fn intersect(&self, other: &Self) -> Self;
}

impl AddressRangeExt for Range<VirtualAddress> {
    fn len(&self) -> usize {
        self.end.checked_sub_addr(self.start).unwrap_or(0)
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn intersect(&self, other: &Self) -> Self {
        let start = core::cmp::max(self.start, other.start);
        let end = core::cmp::min(self.end, other.end);

        start..core::cmp::max(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn align_down_stays_below(addr: usize, shift in 0u32..20) {
            let align = 1usize << shift;
            let aligned = VirtualAddress::new(addr).align_down(align);

            prop_assert!(aligned.is_aligned_to(align));
            prop_assert!(aligned.get() <= addr);
            prop_assert!(addr - aligned.get() < align);
        }

        #[test]
        fn align_up_stays_above(addr in 0usize..usize::MAX / 2, shift in 0u32..20) {
            let align = 1usize << shift;
            let aligned = VirtualAddress::new(addr).checked_align_up(align).unwrap();

            prop_assert!(aligned.is_aligned_to(align));
            prop_assert!(aligned.get() >= addr);
            prop_assert!(aligned.get() - addr < align);
        }

        #[test]
        fn intersect_is_contained(a in 0usize..4096, b in 0usize..4096, c in 0usize..4096, d in 0usize..4096) {
            let lhs = VirtualAddress::new(a.min(b))..VirtualAddress::new(a.max(b));
            let rhs = VirtualAddress::new(c.min(d))..VirtualAddress::new(c.max(d));
            let both = lhs.intersect(&rhs);

            prop_assert!(both.len() <= lhs.len());
            prop_assert!(both.len() <= rhs.len());
            prop_assert_eq!(both.len() > 0, lhs.overlaps(&rhs));
        }
    }

    #[test]
    fn sub_below_origin_is_none() {
        let base = VirtualAddress::new(0x40_0000);

        assert_eq!(VirtualAddress::new(0x3f_ffff).checked_sub_addr(base), None);
        assert_eq!(VirtualAddress::new(0x40_0010).checked_sub_addr(base), Some(0x10));
    }

    #[test]
    fn align_up_overflow() {
        assert_eq!(VirtualAddress::MAX.checked_align_up(4096), None);
        assert_eq!(
            VirtualAddress::new(0x1001).checked_align_up(0x1000),
            Some(VirtualAddress::new(0x2000))
        );
    }
}
