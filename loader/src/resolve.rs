// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use exec_parser::{Segment, SegmentTable, VirtualAddress};

/// Finds the segment containing `addr`.
///
/// Segments are searched in table order, so if segments overlap the first one wins.
#[must_use]
pub fn resolve(table: &SegmentTable, addr: VirtualAddress) -> Option<&Segment> {
    table.iter().find(|segment| segment.contains(addr))
}
