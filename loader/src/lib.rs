// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Demand-paged loading of static executables.
//!
//! [`execute`] doesn't copy a single byte of the program into memory. It only reserves the
//! address ranges of the program's segments with inaccessible mappings and jumps to the entry
//! point. Every first access to a page of the program then raises a `SIGSEGV` that is caught by
//! the loader's fault handler, which fills the page from the executable (or with zeroes for
//! bss), applies the segment's permissions and lets the program continue.
//!
//! ```no_run
//! # fn main() -> Result<(), lazyload::Error> {
//! lazyload::init_loader()?;
//! lazyload::execute("/usr/local/bin/hello", &[c"hello".to_owned()])?;
//! # Ok(())
//! # }
//! ```

mod error;
mod fault;
mod loader;
pub mod logger;
mod materialize;
mod page_cache;
mod resolve;
mod sys;

use core::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub use error::Error;
pub use exec_launcher::LaunchInfo;
pub use exec_parser::{Permissions, Segment, SegmentTable, VirtualAddress};
pub use fault::{FatalFault, FaultKind, handle_fault};
pub use loader::{Image, Loader};
pub use materialize::{fill_page, materialize};
pub use page_cache::PageCache;
pub use resolve::resolve;

pub type Result<T> = core::result::Result<T, Error>;

/// Exit status of the process when the loaded program faults in a way the loader can't resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    /// The program accessed memory outside of all of its segments.
    pub const SEGMENT_NOT_FOUND: Self = Self(139);
    /// The program faulted on a page that was already materialized, e.g. by writing to
    /// read-only memory.
    pub const ALREADY_MATERIALIZED: Self = Self(140);
    /// The loader itself failed while resolving a fault.
    pub const LOADER_FAILURE: Self = Self(141);
}

/// Sets up the loader and installs the fault handler.
///
/// # Errors
///
/// Returns an error if the loader was already initialized or the handler can't be installed.
pub fn init_loader() -> Result<()> {
    let page_size = sys::page_size();

    if loader::LOADER.is_completed() {
        return Err(Error::AlreadyInitialized);
    }

    // the state is published only once the handler is in place, a failed install can be retried
    sys::install_fault_handler(fault::on_segv)?;

    let mut fresh = false;
    loader::LOADER.call_once(|| {
        fresh = true;
        spin::Mutex::new(Loader::new(page_size))
    });
    if !fresh {
        return Err(Error::AlreadyInitialized);
    }

    log::debug!("loader initialized (page size {page_size:#x})");
    Ok(())
}

/// Loads the executable at `path` and runs it with the argument vector `args`.
///
/// The program inherits the environment of the current process. `args` should include the
/// program name as its first element.
///
/// # Errors
///
/// Returns an error if the program can't be loaded (see [`load`]) or its stack can't be set
/// up. Once the program starts this function never returns.
pub fn execute(path: impl AsRef<Path>, args: &[CString]) -> Result<Infallible> {
    let info = load(path)?;
    let env = environment();

    Ok(exec_launcher::start(&info, args, &env)?)
}

/// Prepares the executable at `path` for lazy loading without starting it.
///
/// The segments' address ranges are reserved and the image is attached to the loader, so from
/// here on every access to the program's memory is served by the fault handler. Returns what
/// the launcher needs to start the program.
///
/// # Errors
///
/// Returns an error if the loader isn't initialized, a program was already loaded, the file
/// can't be opened or parsed, or the program's address ranges are already in use. A file that
/// fails to parse leaves the loader untouched.
pub fn load(path: impl AsRef<Path>) -> Result<LaunchInfo> {
    let path = path.as_ref();
    let state = loader::LOADER.get().ok_or(Error::NotInitialized)?;

    if state.lock().image().is_some() {
        return Err(Error::AlreadyLoaded);
    }

    let file = File::open(path)?;
    let segments = exec_parser::parse_file(&file)?;

    log::info!(
        "loading {} ({} segments, entry {})",
        path.display(),
        segments.len(),
        segments.entry
    );
    for segment in &segments {
        log::debug!("{segment}");
    }

    let mut state = state.lock();
    let page_size = state.page_size();

    let reserved = loader::reserve_segments(&segments, page_size)?;
    let image = match state.attach(segments, file) {
        Ok(image) => image,
        Err(err) => {
            loader::release_reservations(&reserved);
            return Err(err);
        }
    };

    let program_headers = image.segments.program_headers;
    Ok(LaunchInfo {
        entry: image.segments.entry.get(),
        phdr: program_headers.map_or(0, |phdrs| phdrs.addr.get()),
        phent: program_headers.map_or(0, |phdrs| phdrs.entry_size),
        phnum: program_headers.map_or(0, |phdrs| phdrs.count),
        page_size,
    })
}

/// Runs `f` with the loader state, returns `None` if the loader isn't initialized.
///
/// # Panics
///
/// Panics if called from within `f`.
pub fn with_loader<R>(f: impl FnOnce(&Loader) -> R) -> Option<R> {
    let state = loader::LOADER.get()?;
    let guard = state.try_lock();
    assert!(guard.is_some(), "loader state is already locked");
    guard.map(|loader| f(&loader))
}

fn environment() -> Vec<CString> {
    std::env::vars_os()
        .filter_map(|(key, value)| {
            let mut var = key.as_bytes().to_vec();
            var.push(b'=');
            var.extend_from_slice(value.as_bytes());
            CString::new(var).ok()
        })
        .collect()
}
