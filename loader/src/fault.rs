// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resolution of memory faults in the loaded program.
//!
//! Every fault inside a reserved segment page is expected exactly once: the first access to a
//! page materializes it, after which it is accessible with the segment's permissions. Any
//! other fault (outside all segments, or on a page that is already materialized, e.g. a write
//! to read-only data) is a genuine crash of the program and terminates the process.
//!
//! The code in this module runs inside a `SIGSEGV` handler on the program's stack, while the
//! program's own runtime owns the thread pointer. It must not allocate, must not use
//! thread-local storage and may only make async-signal-safe calls.

use crate::loader::{LOADER, Loader};
use crate::materialize::materialize;
use crate::resolve::resolve;
use crate::sys::CallFailed;
use crate::{ExitCode, sys};
use core::ffi::{c_int, c_void};
use core::fmt;
use exec_parser::VirtualAddress;

/// What the kernel reported about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// `SEGV_MAPERR`, nothing is mapped at the address.
    NotMapped,
    /// `SEGV_ACCERR`, the mapping doesn't permit the access. Reserved pages fault like this.
    AccessDenied,
    Other(c_int),
}

impl FaultKind {
    #[must_use]
    pub fn from_code(si_code: c_int) -> Self {
        match si_code {
            sys::SEGV_MAPERR => Self::NotMapped,
            sys::SEGV_ACCERR => Self::AccessDenied,
            code => Self::Other(code),
        }
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalFault {
    SegmentNotFound,
    AlreadyMaterialized,
    NotInitialized,
    NoImage,
    /// The loader state was locked when the fault occurred.
    Contended,
    /// Mapping or protecting the page failed in the named call.
    Platform(&'static str),
}

impl FatalFault {
    #[must_use]
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::SegmentNotFound => ExitCode::SEGMENT_NOT_FOUND,
            Self::AlreadyMaterialized => ExitCode::ALREADY_MATERIALIZED,
            Self::NotInitialized | Self::NoImage | Self::Contended | Self::Platform(_) => {
                ExitCode::LOADER_FAILURE
            }
        }
    }
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentNotFound => f.write_str("address is outside of every segment"),
            Self::AlreadyMaterialized => f.write_str("page is already materialized"),
            Self::NotInitialized => f.write_str("loader is not initialized"),
            Self::NoImage => f.write_str("no program is loaded"),
            Self::Contended => f.write_str("loader state is locked"),
            Self::Platform(call) => write!(f, "{call} failed while mapping the page"),
        }
    }
}

/// Resolves a fault at `addr`, materializing the page it falls into.
///
/// Returns the materialized page. On success the faulting instruction can be restarted.
///
/// # Errors
///
/// Returns the reason the fault is fatal, see [`FatalFault`].
pub fn handle_fault(
    loader: &mut Loader,
    addr: VirtualAddress,
    kind: FaultKind,
) -> Result<VirtualAddress, FatalFault> {
    let (page_size, pages, image) = loader.parts_mut();
    let image = image.ok_or(FatalFault::NoImage)?;

    log::trace!("fault at {addr} ({kind:?})");

    // resolving
    let segment = resolve(&image.segments, addr).ok_or(FatalFault::SegmentNotFound)?;

    // checking
    if pages.is_materialized(addr) {
        return Err(FatalFault::AlreadyMaterialized);
    }

    // materializing
    let page = addr.align_down(page_size);
    materialize(segment, page, &image.file, &mut image.scratch)
        .map_err(|CallFailed(call)| FatalFault::Platform(call))?;
    pages.record(page);

    Ok(page)
}

/// The `SIGSEGV` handler.
pub(crate) extern "C" fn on_segv(_signal: c_int, info: *mut libc::siginfo_t, _context: *mut c_void) {
    // Safety: the kernel passes a valid siginfo_t to SA_SIGINFO handlers
    let (addr, code) = unsafe { ((*info).si_addr(), (*info).si_code) };
    let addr = VirtualAddress::from_ptr(addr);

    let outcome = match LOADER.get() {
        Some(loader) => match loader.try_lock() {
            Some(mut loader) => handle_fault(&mut loader, addr, FaultKind::from_code(code)),
            None => Err(FatalFault::Contended),
        },
        None => Err(FatalFault::NotInitialized),
    };

    if let Err(fatal) = outcome {
        let code = fatal.exit_code();
        log::error!("unresolvable fault at {addr}: {fatal}, exiting with {}", code.0);
        sys::exit(code.0);
    }
}
