// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Assembles minimal ELF64 images in memory for tests.
//!
//! Segment contents are laid out back to back after the program header table. The loader reads
//! pages with positioned reads, so file offsets don't need to be congruent to addresses.
#![allow(clippy::cast_possible_truncation, reason = "fixture sizes are tiny")]

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = 62;
#[cfg(target_arch = "aarch64")]
const HOST_MACHINE: u16 = 183;
#[cfg(target_arch = "riscv64")]
const HOST_MACHINE: u16 = 243;

struct Header {
    p_type: u32,
    flags: u32,
    offset: Option<u64>,
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
    data: Vec<u8>,
}

pub struct ElfBuilder {
    entry: u64,
    e_type: u16,
    headers: Vec<Header>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            e_type: 2, // ET_EXEC
            headers: Vec::new(),
        }
    }

    pub fn e_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    /// Adds a load segment whose `file_size` bytes of content are appended to the image.
    pub fn load(self, vaddr: u64, flags: u32, file_size: u64, mem_size: u64) -> Self {
        let data = (0..file_size).map(|i| (i % 251) as u8).collect();
        self.load_with(vaddr, flags, data, mem_size)
    }

    /// Adds a load segment with the given content.
    pub fn load_with(mut self, vaddr: u64, flags: u32, data: Vec<u8>, mem_size: u64) -> Self {
        self.headers.push(Header {
            p_type: PT_LOAD,
            flags,
            offset: None,
            vaddr,
            file_size: data.len() as u64,
            mem_size,
            data,
        });
        self
    }

    /// Adds a load segment pointing at an explicit file offset without appending content.
    pub fn load_at_offset(
        mut self,
        vaddr: u64,
        flags: u32,
        offset: u64,
        file_size: u64,
        mem_size: u64,
    ) -> Self {
        self.headers.push(Header {
            p_type: PT_LOAD,
            flags,
            offset: Some(offset),
            vaddr,
            file_size,
            mem_size,
            data: Vec::new(),
        });
        self
    }

    pub fn interp(mut self) -> Self {
        let data = b"/lib64/ld-linux-x86-64.so.2\0".to_vec();
        self.headers.push(Header {
            p_type: PT_INTERP,
            flags: PF_R,
            offset: None,
            vaddr: 0,
            file_size: data.len() as u64,
            mem_size: data.len() as u64,
            data,
        });
        self
    }

    /// Serializes the image.
    ///
    /// # Panics
    ///
    /// Panics if the header layout is inconsistent.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let phnum = self.headers.len();
        let mut out = Vec::new();

        // e_ident
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&HOST_MACHINE.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(out.len(), 64);

        let mut data_offset = (64 + 56 * phnum as u64).next_multiple_of(16);
        let mut payload = Vec::new();

        for header in &self.headers {
            let offset = header.offset.unwrap_or_else(|| {
                let offset = data_offset;
                data_offset += header.data.len() as u64;
                payload.extend_from_slice(&header.data);
                offset
            });

            out.extend_from_slice(&header.p_type.to_le_bytes());
            out.extend_from_slice(&header.flags.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&header.vaddr.to_le_bytes());
            out.extend_from_slice(&header.vaddr.to_le_bytes()); // p_paddr
            out.extend_from_slice(&header.file_size.to_le_bytes());
            out.extend_from_slice(&header.mem_size.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
        }

        out.resize((64 + 56 * phnum).next_multiple_of(16), 0);
        out.extend_from_slice(&payload);
        out
    }
}
