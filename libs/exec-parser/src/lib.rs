// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Turns a statically linked ELF executable into a [`SegmentTable`].
//!
//! Only the information required to load the program lazily is extracted: one [`Segment`] per
//! non-empty `PT_LOAD` program header, the entry point and the location of the program header
//! table in memory. Executables that need a program interpreter, position independent
//! executables and executables for a foreign architecture are rejected.

mod address;
mod error;
mod segment;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::fs::File;
use std::os::unix::fs::FileExt;

pub use address::{AddressRangeExt, VirtualAddress};
pub use error::Error;
pub use segment::{Permissions, ProgramHeaders, Segment, SegmentTable};
use xmas_elf::ElfFile;
use xmas_elf::header::{self, Class, Data, Header, Machine};
use xmas_elf::program::{self, ProgramHeader};

pub type Result<T> = core::result::Result<T, Error>;

const ELF64_HEADER_SIZE: usize = 64;
const ELF64_PROGRAM_HEADER_SIZE: usize = 56;

/// Parses the executable behind `file`.
///
/// Only the ELF header and the program header table are read; segment contents stay on disk.
///
/// # Errors
///
/// Returns an error if reading the file fails or the file isn't a loadable executable, see
/// [`parse`].
pub fn parse_file(file: &File) -> Result<SegmentTable> {
    let mut ehdr = [0u8; ELF64_HEADER_SIZE];
    file.read_exact_at(&mut ehdr, 0)?;

    let header = header::parse_header(&ehdr).map_err(Error::Elf)?;
    check_header(&header)?;
    let table_end = program_header_table_end(&header)?;

    let mut prefix = vec![0u8; table_end.max(ELF64_HEADER_SIZE)];
    file.read_exact_at(&mut prefix, 0)
        .map_err(|_| Error::ProgramHeaders)?;

    parse(&prefix)
}

/// Parses an in-memory ELF image into its segment table.
///
/// # Errors
///
/// Returns an error if `input` is not a 64-bit `ET_EXEC` ELF file for the host architecture,
/// requests a program interpreter, has a truncated program header table, contains a segment
/// whose address range overflows, or contains no loadable segments at all.
pub fn parse(input: &[u8]) -> Result<SegmentTable> {
    let elf_file = ElfFile::new(input).map_err(Error::Elf)?;
    check_header(&elf_file.header)?;

    if program_header_table_end(&elf_file.header)? > input.len() {
        return Err(Error::ProgramHeaders);
    }

    let mut segments = Vec::new();
    let mut phdr_segment = None;

    for ph in elf_file.program_iter() {
        let Ok(ty) = ph.get_type() else {
            log::trace!("skipping program header of unknown type");
            continue;
        };

        match ty {
            program::Type::Load => {
                if let Some(segment) = load_segment(&ph)? {
                    log::trace!("LOAD {segment}");
                    segments.push(segment);
                }
            }
            program::Type::Interp => return Err(Error::Interpreter),
            program::Type::Phdr => {
                phdr_segment = Some(VirtualAddress::try_from(ph.virtual_addr())?);
            }
            _ => {}
        }
    }

    if segments.is_empty() {
        return Err(Error::NoLoadableSegments);
    }

    let pt2 = &elf_file.header.pt2;
    let program_headers = locate_program_headers(&segments, phdr_segment, pt2)?;

    Ok(SegmentTable {
        segments,
        entry: VirtualAddress::try_from(pt2.entry_point())?,
        program_headers,
    })
}

fn check_header(header: &Header) -> Result<()> {
    if !matches!(header.pt1.class(), Class::SixtyFour) {
        return Err(Error::UnsupportedClass);
    }

    let host_endian = match header.pt1.data() {
        Data::LittleEndian => cfg!(target_endian = "little"),
        Data::BigEndian => cfg!(target_endian = "big"),
        _ => false,
    };
    if !host_endian {
        return Err(Error::UnsupportedEndianness);
    }

    let machine = header.pt2.machine().as_machine();
    if !is_host_machine(machine) {
        return Err(Error::UnsupportedMachine(machine));
    }

    match header.pt2.type_().as_type() {
        header::Type::Executable => Ok(()),
        other => Err(Error::NotExecutable(other)),
    }
}

fn is_host_machine(machine: Machine) -> bool {
    #[cfg(target_arch = "x86_64")]
    return matches!(machine, Machine::X86_64);
    #[cfg(target_arch = "aarch64")]
    return matches!(machine, Machine::AArch64);
    #[cfg(target_arch = "riscv64")]
    return matches!(machine, Machine::RISC_V);
}

/// Returns the file offset one past the end of the program header table.
fn program_header_table_end(header: &Header) -> Result<usize> {
    let entry_size = usize::from(header.pt2.ph_entry_size());
    let count = usize::from(header.pt2.ph_count());

    if count > 0 && entry_size != ELF64_PROGRAM_HEADER_SIZE {
        return Err(Error::ProgramHeaders);
    }

    usize::try_from(header.pt2.ph_offset())?
        .checked_add(entry_size.checked_mul(count).ok_or(Error::ProgramHeaders)?)
        .ok_or(Error::ProgramHeaders)
}

fn load_segment(ph: &ProgramHeader) -> Result<Option<Segment>> {
    let vaddr = ph.virtual_addr();
    let mem_size = usize::try_from(ph.mem_size())?;
    let mut file_size = usize::try_from(ph.file_size())?;

    if mem_size == 0 {
        return Ok(None);
    }

    if file_size > mem_size {
        log::warn!(
            "segment at {vaddr:#x} has more file bytes ({file_size:#x}) than memory ({mem_size:#x}), truncating"
        );
        file_size = mem_size;
    }

    let virtual_base = VirtualAddress::try_from(vaddr)?;
    if virtual_base.checked_add(mem_size).is_none() {
        return Err(Error::SegmentOverflow(vaddr));
    }
    if ph
        .offset()
        .checked_add(u64::try_from(file_size)?)
        .is_none()
    {
        return Err(Error::SegmentOverflow(vaddr));
    }

    Ok(Some(Segment {
        virtual_base,
        mem_size,
        file_offset: ph.offset(),
        file_size,
        permissions: Permissions::from(ph.flags()),
    }))
}

/// Finds the program header table in the loaded image, either through an explicit `PT_PHDR`
/// header or through the load segment whose file content covers it.
fn locate_program_headers(
    segments: &[Segment],
    phdr_segment: Option<VirtualAddress>,
    pt2: &header::HeaderPt2<'_>,
) -> Result<Option<ProgramHeaders>> {
    let entry_size = usize::from(pt2.ph_entry_size());
    let count = usize::from(pt2.ph_count());

    if let Some(addr) = phdr_segment {
        return Ok(Some(ProgramHeaders {
            addr,
            entry_size,
            count,
        }));
    }

    let offset = pt2.ph_offset();
    let size = u64::try_from(entry_size * count)?;

    for segment in segments {
        let file_size = u64::try_from(segment.file_size)?;
        let Some(rel) = offset.checked_sub(segment.file_offset) else {
            continue;
        };

        if rel.checked_add(size).is_some_and(|end| end <= file_size) {
            let addr = segment
                .virtual_base
                .checked_add(usize::try_from(rel)?)
                .ok_or(Error::ProgramHeaders)?;

            return Ok(Some(ProgramHeaders {
                addr,
                entry_size,
                count,
            }));
        }
    }

    Ok(None)
}
