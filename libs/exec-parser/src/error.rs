// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    /// Failed to read the executable
    Io(#[from] std::io::Error),
    /// Failed to convert number
    TryFromInt(#[from] core::num::TryFromIntError),
    /// Failed to parse ELF file
    #[error("failed to parse ELF file: {0}")]
    Elf(&'static str),
    /// Only 64-bit ELF files are supported
    UnsupportedClass,
    /// The executable's byte order doesn't match the host
    UnsupportedEndianness,
    /// The executable was built for a different architecture than the host
    #[error("executable targets {0:?} which is not the host architecture")]
    UnsupportedMachine(xmas_elf::header::Machine),
    /// Only statically linked `ET_EXEC` executables can be loaded
    #[error("expected an executable ELF file, found {0:?}")]
    NotExecutable(xmas_elf::header::Type),
    /// Executables requesting a program interpreter are not supported
    Interpreter,
    /// The program header table is malformed or lies outside the file
    ProgramHeaders,
    /// A segment's address range overflows the address space
    #[error("segment at {0:#x} overflows the address space")]
    SegmentOverflow(u64),
    /// The executable contains no loadable segments
    NoLoadableSegments,
}
