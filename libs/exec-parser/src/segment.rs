// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::VirtualAddress;
use core::fmt;
use core::ops::Range;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// Allow reads from the memory region
        const READ = 1 << 0;
        /// Allow writes to the memory region
        const WRITE = 1 << 1;
        /// Allow code execution from the memory region
        const EXECUTE = 1 << 2;
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

impl From<xmas_elf::program::Flags> for Permissions {
    fn from(flags: xmas_elf::program::Flags) -> Self {
        let mut out = Permissions::empty();
        out.set(Permissions::READ, flags.is_read());
        out.set(Permissions::WRITE, flags.is_write());
        out.set(Permissions::EXECUTE, flags.is_execute());
        out
    }
}

/// A loadable segment of an executable.
///
/// Bytes at segment-relative offsets `0..file_size` come from the executable at
/// `file_offset..file_offset + file_size`, bytes in `file_size..mem_size` (the bss tail)
/// read as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub virtual_base: VirtualAddress,
    pub mem_size: usize,
    pub file_offset: u64,
    pub file_size: usize,
    pub permissions: Permissions,
}

impl Segment {
    /// Returns the offset of `addr` relative to the start of this segment, or `None` if
    /// the segment doesn't contain `addr`.
    ///
    /// The containment test is `0 <= addr - virtual_base < mem_size`.
    #[must_use]
    pub fn offset_of(&self, addr: VirtualAddress) -> Option<usize> {
        addr.checked_sub_addr(self.virtual_base)
            .filter(|offset| *offset < self.mem_size)
    }

    #[must_use]
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.offset_of(addr).is_some()
    }

    /// The virtual address range occupied by this segment in memory.
    #[must_use]
    pub fn virt_range(&self) -> Range<VirtualAddress> {
        // `mem_size` was checked against overflow when the segment was parsed
        self.virtual_base..VirtualAddress::new(self.virtual_base.get() + self.mem_size)
    }

    /// The virtual address range backed by file content, a prefix of [`Self::virt_range`].
    #[must_use]
    pub fn file_backed_range(&self) -> Range<VirtualAddress> {
        self.virtual_base..VirtualAddress::new(self.virtual_base.get() + self.file_size)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = self.virt_range();
        write!(
            f,
            "{:#x}..{:#x} {} (file {:#x}+{:#x})",
            range.start, range.end, self.permissions, self.file_offset, self.file_size
        )
    }
}

/// Location of the program header table inside the loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeaders {
    pub addr: VirtualAddress,
    pub entry_size: usize,
    pub count: usize,
}

/// The parsed form of an executable: its loadable segments in file order plus the
/// information needed to start it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTable {
    pub segments: Vec<Segment>,
    pub entry: VirtualAddress,
    pub program_headers: Option<ProgramHeaders>,
}

impl SegmentTable {
    pub fn iter(&self) -> core::slice::Iter<'_, Segment> {
        self.segments.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl<'a> IntoIterator for &'a SegmentTable {
    type Item = &'a Segment;
    type IntoIter = core::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}
