// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Transfers control to a loaded program.
//!
//! [`start`] builds the initial process stack the System V ABI prescribes (argument count,
//! argument and environment pointers, the auxiliary vector and the strings they point to) on a
//! freshly mapped stack and jumps to the program's entry point. It only returns if the stack
//! couldn't be created.

mod arch;
mod stack;

use std::convert::Infallible;
use std::ffi::CString;
use std::io;

pub use stack::InitialStack;

pub const STACK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    /// Failed to map the initial stack
    Io(#[from] io::Error),
    /// The arguments and environment don't fit on the initial stack
    StackExhausted,
}

/// What the launcher needs to know about the loaded program.
#[derive(Debug, Clone, Copy)]
pub struct LaunchInfo {
    pub entry: usize,
    /// Address of the program header table inside the loaded image, or `0` if unknown.
    pub phdr: usize,
    pub phent: usize,
    pub phnum: usize,
    pub page_size: usize,
}

/// Starts the program described by `info` with the given argument vector and environment.
///
/// # Errors
///
/// Returns an error if the initial stack can't be mapped or `args` and `env` don't fit on it.
/// On success this function never returns.
pub fn start(info: &LaunchInfo, args: &[CString], env: &[CString]) -> Result<Infallible, Error> {
    let mut stack = InitialStack::new(STACK_SIZE, info.page_size)?;
    build_initial_stack(&mut stack, info, args, env)?;
    let sp = stack.finish();

    log::debug!(
        "starting program at {:#x} (argc={}, envc={})",
        info.entry,
        args.len(),
        env.len()
    );

    // Safety: the stack was set up according to the ABI and the entry point belongs to the
    // image the caller prepared
    unsafe { arch::jump_to_entry(sp, info.entry) }
}

/// Lays out the initial process stack and returns the final stack pointer.
///
/// From the stack pointer upwards: `argc`, `argv[0..argc]`, `NULL`, `envp[..]`, `NULL`,
/// auxiliary vector pairs terminated by `AT_NULL`, followed by the strings and random bytes
/// they reference.
///
/// # Errors
///
/// Returns [`Error::StackExhausted`] if the layout doesn't fit on `stack`.
pub fn build_initial_stack(
    stack: &mut InitialStack,
    info: &LaunchInfo,
    args: &[CString],
    env: &[CString],
) -> Result<usize, Error> {
    let random = stack.push_bytes(&random_bytes())?;
    let execfn = match args.first() {
        Some(arg0) => Some(stack.push_cstr(arg0)?),
        None => None,
    };

    let mut env_ptrs = Vec::with_capacity(env.len());
    for var in env.iter().rev() {
        env_ptrs.push(stack.push_cstr(var)?);
    }
    let mut arg_ptrs = Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        arg_ptrs.push(stack.push_cstr(arg)?);
    }

    let auxv = auxiliary_vector(info, random, execfn);

    stack.align(16);
    let words = 1 + (arg_ptrs.len() + 1) + (env_ptrs.len() + 1) + 2 * (auxv.len() + 1);
    if words % 2 != 0 {
        stack.push_usize(0)?;
    }

    // auxv, terminated by AT_NULL
    stack.push_usize(0)?;
    stack.push_usize(to_usize(libc::AT_NULL))?;
    for (key, value) in auxv.iter().rev() {
        stack.push_usize(*value)?;
        stack.push_usize(*key)?;
    }

    // `env_ptrs` and `arg_ptrs` were collected back to front, iterating them in order pushes
    // the first pointer last so that it ends up lowest.
    stack.push_usize(0)?;
    for ptr in &env_ptrs {
        stack.push_usize(*ptr)?;
    }
    stack.push_usize(0)?;
    for ptr in &arg_ptrs {
        stack.push_usize(*ptr)?;
    }
    stack.push_usize(args.len())?;

    debug_assert_eq!(stack.sp() % 16, 0);
    Ok(stack.sp())
}

fn auxiliary_vector(info: &LaunchInfo, random: usize, execfn: Option<usize>) -> Vec<(usize, usize)> {
    let mut auxv = vec![
        (to_usize(libc::AT_PAGESZ), info.page_size),
        (to_usize(libc::AT_ENTRY), info.entry),
        (to_usize(libc::AT_BASE), 0),
        (to_usize(libc::AT_FLAGS), 0),
        (to_usize(libc::AT_RANDOM), random),
        (to_usize(libc::AT_SECURE), 0),
    ];

    if info.phdr != 0 {
        auxv.push((to_usize(libc::AT_PHDR), info.phdr));
        auxv.push((to_usize(libc::AT_PHENT), info.phent));
        auxv.push((to_usize(libc::AT_PHNUM), info.phnum));
    }
    if let Some(execfn) = execfn {
        auxv.push((to_usize(libc::AT_EXECFN), execfn));
    }

    // entries describing the process and the machine are forwarded from our own auxv
    for key in [
        libc::AT_UID,
        libc::AT_EUID,
        libc::AT_GID,
        libc::AT_EGID,
        libc::AT_HWCAP,
        libc::AT_HWCAP2,
        libc::AT_CLKTCK,
        libc::AT_SYSINFO_EHDR,
    ] {
        // Safety: getauxval has no preconditions
        let value = unsafe { libc::getauxval(key) };
        if value != 0 || matches!(key, libc::AT_UID | libc::AT_EUID | libc::AT_GID | libc::AT_EGID) {
            auxv.push((to_usize(key), to_usize(value)));
        }
    }

    auxv
}

fn random_bytes() -> [u8; 16] {
    let mut buf = [0u8; 16];
    let mut filled = 0;

    while filled < buf.len() {
        // Safety: the destination lies within `buf`
        let ret = unsafe {
            libc::getrandom(
                buf[filled..].as_mut_ptr().cast(),
                buf.len() - filled,
                0,
            )
        };
        match usize::try_from(ret) {
            Ok(n) => filled += n,
            Err(_) if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted => {}
            Err(_) => {
                log::warn!("getrandom failed, AT_RANDOM will be predictable");
                break;
            }
        }
    }

    buf
}

#[inline]
fn to_usize(v: libc::c_ulong) -> usize {
    // c_ulong is pointer sized on every supported target
    usize::try_from(v).unwrap_or(usize::MAX)
}
