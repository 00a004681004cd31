// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use exec_parser::VirtualAddress;

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    /// Failed to open the executable
    Io(#[from] std::io::Error),
    /// Failed to parse the executable
    Parse(#[from] exec_parser::Error),
    /// Failed to start the program
    Launch(#[from] exec_launcher::Error),
    /// The address range requested by the executable is already in use
    #[error("address range {0}..{1} is already in use")]
    AddressInUse(VirtualAddress, VirtualAddress),
    /// The executable's address range overflows the address space
    AddressOverflow,
    /// The loader has already been initialized
    AlreadyInitialized,
    /// The loader has not been initialized
    NotInitialized,
    /// A program has already been loaded into this process
    AlreadyLoaded,
}
