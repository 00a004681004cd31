// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end tests of the fault handler.
//!
//! The loader is a process-wide singleton and fatal faults terminate the process, so every
//! scenario runs in a forked child and reports through its exit status.

#![allow(clippy::cast_possible_truncation, reason = "fixture sizes are tiny")]

use exec_parser::test_utils::{ElfBuilder, PF_R, PF_W, PF_X};
use lazyload::{Error, ExitCode};
use std::io::Write;
use std::panic;
use std::process;
use std::ptr;
use tempfile::NamedTempFile;

const BASE: usize = 0x10_0000_0000;

struct Load {
    vaddr: usize,
    flags: u32,
    data: Vec<u8>,
    mem_size: usize,
}

fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

/// Writes a static executable with the given load segments and entry point `BASE` to a
/// temporary file.
fn executable(loads: &[Load]) -> NamedTempFile {
    let image = loads
        .iter()
        .fold(ElfBuilder::new(BASE as u64), |builder, load| {
            builder.load_with(
                load.vaddr as u64,
                load.flags,
                load.data.clone(),
                load.mem_size as u64,
            )
        })
        .build();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file
}

/// Machine code that reads the byte at `addr`, adds `add` and exits the process with the sum.
#[cfg(target_arch = "x86_64")]
fn exit_with_byte_at(addr: usize, add: u8) -> Vec<u8> {
    let mut code = vec![0x48, 0xb8]; // mov rax, addr
    code.extend_from_slice(&(addr as u64).to_le_bytes());
    code.extend_from_slice(&[0x0f, 0xb6, 0x38]); // movzx edi, byte [rax]
    code.extend_from_slice(&[0x83, 0xc7, add]); // add edi, add
    code.extend_from_slice(&[0xb8, 0xe7, 0x00, 0x00, 0x00]); // mov eax, exit_group
    code.extend_from_slice(&[0x0f, 0x05]); // syscall
    code
}

#[cfg(target_arch = "aarch64")]
fn exit_with_byte_at(addr: usize, add: u8) -> Vec<u8> {
    let insns: [u32; 6] = [
        0x5800_00c1, // ldr x1, addr
        0x3940_0020, // ldrb w0, [x1]
        0x1100_0000 | (u32::from(add) << 10), // add w0, w0, add
        0xd280_0bc8, // mov x8, exit_group
        0xd400_0001, // svc 0
        0xd503_201f, // nop
    ];
    let mut code: Vec<u8> = insns.iter().flat_map(|insn| insn.to_le_bytes()).collect();
    code.extend_from_slice(&(addr as u64).to_le_bytes());
    code
}

#[cfg(target_arch = "riscv64")]
fn exit_with_byte_at(addr: usize, add: u8) -> Vec<u8> {
    let insns: [u32; 6] = [
        0x0000_0597, // auipc a1, 0
        0x0185_b583, // ld a1, 24(a1)
        0x0005_c503, // lbu a0, 0(a1)
        0x0005_0513 | (u32::from(add) << 20), // addi a0, a0, add
        0x05e0_0893, // li a7, exit_group
        0x0000_0073, // ecall
    ];
    let mut code: Vec<u8> = insns.iter().flat_map(|insn| insn.to_le_bytes()).collect();
    code.extend_from_slice(&(addr as u64).to_le_bytes());
    code
}

/// A program whose code at `BASE` exits with the byte at `addr` plus `add`, and a writable
/// data segment at `data_base` holding 35 followed by a page of bss.
fn exiting_program(data_base: usize, addr: usize, add: u8) -> NamedTempFile {
    let page_size = page_size();
    let code = exit_with_byte_at(addr, add);
    let code_len = code.len();

    executable(&[
        Load {
            vaddr: BASE,
            flags: PF_R | PF_X,
            data: code,
            mem_size: code_len,
        },
        Load {
            vaddr: data_base,
            flags: PF_R | PF_W,
            data: vec![35],
            mem_size: 2 * page_size,
        },
    ])
}

fn read(addr: usize) -> u8 {
    // Safety: callers only read addresses of loaded segments, the fault handler maps them
    unsafe { ptr::with_exposed_provenance::<u8>(addr).read_volatile() }
}

fn write(addr: usize, value: u8) {
    // Safety: see `read`
    unsafe { ptr::with_exposed_provenance_mut::<u8>(addr).write_volatile(value) }
}

fn materialized_pages() -> usize {
    lazyload::with_loader(|loader| loader.pages().len()).unwrap()
}

fn reads_materialize_once() {
    let page_size = page_size();
    let data = pattern(2 * page_size);
    let exe = executable(&[Load {
        vaddr: BASE,
        flags: PF_R | PF_X,
        data: data.clone(),
        mem_size: 2 * page_size,
    }]);

    lazyload::init_loader().unwrap();
    let info = lazyload::load(exe.path()).unwrap();
    assert_eq!(info.entry, BASE);
    assert_eq!(materialized_pages(), 0);

    for (i, expected) in data[..page_size].iter().enumerate() {
        assert_eq!(read(BASE + i), *expected);
    }
    assert_eq!(materialized_pages(), 1);

    assert_eq!(read(BASE + page_size + 5), data[page_size + 5]);
    assert_eq!(read(BASE + 5), data[5]);
    assert_eq!(materialized_pages(), 2);
}

fn zero_fills_bss_tail() {
    let page_size = page_size();
    let data = pattern(page_size + 10);
    let exe = executable(&[Load {
        vaddr: BASE,
        flags: PF_R | PF_W,
        data: data.clone(),
        mem_size: 3 * page_size,
    }]);

    lazyload::init_loader().unwrap();
    lazyload::load(exe.path()).unwrap();

    let second = BASE + page_size;
    for i in 0..10 {
        assert_eq!(read(second + i), data[page_size + i]);
    }
    for i in 10..page_size {
        assert_eq!(read(second + i), 0);
    }
    for i in (0..page_size).step_by(64) {
        assert_eq!(read(second + page_size + i), 0);
    }

    // writable segments stay writable after materialization
    write(second + page_size, 0x42);
    assert_eq!(read(second + page_size), 0x42);
    assert_eq!(materialized_pages(), 2);
}

fn access_outside_segments() {
    let page_size = page_size();
    let exe = executable(&[Load {
        vaddr: BASE,
        flags: PF_R,
        data: pattern(16),
        mem_size: page_size,
    }]);

    lazyload::init_loader().unwrap();
    lazyload::load(exe.path()).unwrap();

    read(BASE + 16 * page_size);
}

fn write_to_read_only_page() {
    let page_size = page_size();
    let exe = executable(&[Load {
        vaddr: BASE,
        flags: PF_R,
        data: pattern(page_size),
        mem_size: page_size,
    }]);

    lazyload::init_loader().unwrap();
    lazyload::load(exe.path()).unwrap();

    // materializes the page read-only, then faults again on the same page
    write(BASE + 8, 0);
}

fn fault_without_image() {
    let page_size = page_size();
    lazyload::init_loader().unwrap();

    // Safety: plain anonymous mapping
    let region = unsafe {
        libc::mmap(
            ptr::null_mut(),
            page_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(region, libc::MAP_FAILED);

    read(region.expose_provenance());
}

fn execute_reads_data() {
    let data_base = BASE + 4 * page_size();
    let exe = exiting_program(data_base, data_base, 7);

    lazyload::init_loader().unwrap();
    let err = lazyload::execute(exe.path(), &[c"prog".to_owned()]).unwrap_err();
    panic!("program didn't start: {err}");
}

fn execute_reads_bss() {
    let page_size = page_size();
    let data_base = BASE + 4 * page_size;
    let exe = exiting_program(data_base, data_base + page_size + 8, 7);

    lazyload::init_loader().unwrap();
    let err = lazyload::execute(exe.path(), &[c"prog".to_owned()]).unwrap_err();
    panic!("program didn't start: {err}");
}

fn execute_missing_file() {
    lazyload::init_loader().unwrap();

    let result = lazyload::execute("/nonexistent/lazyload-test", &[c"prog".to_owned()]);
    assert!(matches!(result, Err(Error::Io(_))));
    assert!(lazyload::with_loader(|loader| loader.image().is_none()).unwrap());
}

fn init_installs_handler() {
    let installed = || {
        // Safety: all-zero is a valid `sigaction`
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        // Safety: only queries the current disposition
        let ret = unsafe { libc::sigaction(libc::SIGSEGV, ptr::null(), &raw mut action) };
        assert_eq!(ret, 0);
        action.sa_sigaction != libc::SIG_DFL && action.sa_flags & libc::SA_SIGINFO != 0
    };

    assert!(!installed());
    lazyload::init_loader().unwrap();
    assert!(installed());
    assert!(lazyload::with_loader(|loader| loader.image().is_none()).unwrap());
}

fn load_requires_init() {
    let exe = executable(&[Load {
        vaddr: BASE,
        flags: PF_R,
        data: pattern(16),
        mem_size: 16,
    }]);

    assert!(matches!(lazyload::load(exe.path()), Err(Error::NotInitialized)));
    assert!(lazyload::with_loader(|_| ()).is_none());
}

fn init_twice() {
    lazyload::init_loader().unwrap();

    assert!(matches!(
        lazyload::init_loader(),
        Err(Error::AlreadyInitialized)
    ));
}

fn parse_failure_leaves_no_state() {
    let page_size = page_size();
    let mut garbage = NamedTempFile::new().unwrap();
    garbage.write_all(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]).unwrap();
    garbage.write_all(&[0; 120]).unwrap();

    lazyload::init_loader().unwrap();
    assert!(matches!(lazyload::load(garbage.path()), Err(Error::Parse(_))));
    assert!(lazyload::with_loader(|loader| loader.image().is_none()).unwrap());
    assert_eq!(materialized_pages(), 0);

    // nothing was reserved, a valid image can still claim the range
    let exe = executable(&[Load {
        vaddr: BASE,
        flags: PF_R,
        data: pattern(page_size),
        mem_size: page_size,
    }]);
    lazyload::load(exe.path()).unwrap();
    assert!(matches!(lazyload::load(exe.path()), Err(Error::AlreadyLoaded)));
}

fn address_in_use() {
    let page_size = page_size();
    let exe = executable(&[
        Load {
            vaddr: BASE,
            flags: PF_R,
            data: pattern(16),
            mem_size: page_size,
        },
        Load {
            vaddr: BASE + 4 * page_size,
            flags: PF_R | PF_W,
            data: pattern(16),
            mem_size: page_size,
        },
    ]);

    // Safety: the range is unused, MAP_FIXED_NOREPLACE makes sure of it
    let occupied = unsafe {
        libc::mmap(
            ptr::with_exposed_provenance_mut(BASE + 4 * page_size),
            page_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    assert_ne!(occupied, libc::MAP_FAILED);

    lazyload::init_loader().unwrap();
    assert!(matches!(
        lazyload::load(exe.path()),
        Err(Error::AddressInUse(..))
    ));
    assert!(lazyload::with_loader(|loader| loader.image().is_none()).unwrap());

    // the first segment's reservation was rolled back
    // Safety: MAP_FIXED_NOREPLACE fails instead of clobbering anything
    let reclaimed = unsafe {
        libc::mmap(
            ptr::with_exposed_provenance_mut(BASE),
            page_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    assert_eq!(reclaimed.expose_provenance(), BASE);
}

/// Runs `scenario` in a forked child and returns its exit status.
fn run_in_child(scenario: fn()) -> i32 {
    // Safety: the test driver is single-threaded
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            let code = match panic::catch_unwind(scenario) {
                Ok(()) => 0,
                Err(_) => 101,
            };
            // Safety: leave the child without running the parent's atexit handlers
            unsafe { libc::_exit(code) }
        }
        pid => {
            let mut status = 0;
            // Safety: `pid` is our child
            let ret = unsafe { libc::waitpid(pid, &raw mut status, 0) };
            assert_eq!(ret, pid);

            if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else {
                128 + libc::WTERMSIG(status)
            }
        }
    }
}

fn main() {
    if std::env::var_os("LAZYLOAD_LOG").is_some() {
        lazyload::logger::init(log::LevelFilter::Trace).unwrap();
    }

    let scenarios: &[(&str, fn(), i32)] = &[
        ("reads_materialize_once", reads_materialize_once, 0),
        ("zero_fills_bss_tail", zero_fills_bss_tail, 0),
        (
            "access_outside_segments",
            access_outside_segments,
            ExitCode::SEGMENT_NOT_FOUND.0,
        ),
        (
            "write_to_read_only_page",
            write_to_read_only_page,
            ExitCode::ALREADY_MATERIALIZED.0,
        ),
        (
            "fault_without_image",
            fault_without_image,
            ExitCode::LOADER_FAILURE.0,
        ),
        ("execute_reads_data", execute_reads_data, 42),
        ("execute_reads_bss", execute_reads_bss, 7),
        ("execute_missing_file", execute_missing_file, 0),
        ("init_installs_handler", init_installs_handler, 0),
        ("load_requires_init", load_requires_init, 0),
        ("init_twice", init_twice, 0),
        ("parse_failure_leaves_no_state", parse_failure_leaves_no_state, 0),
        ("address_in_use", address_in_use, 0),
    ];

    println!("\nrunning {} tests", scenarios.len());

    let mut failed = Vec::new();
    for (name, scenario, expected) in scenarios {
        let status = run_in_child(*scenario);
        if status == *expected {
            println!("test {name} ... ok");
        } else {
            println!("test {name} ... FAILED (exit status {status}, expected {expected})");
            failed.push(*name);
        }
    }

    if failed.is_empty() {
        println!("\ntest result: ok. {} passed\n", scenarios.len());
    } else {
        println!("\nfailures: {failed:?}\n");
        process::exit(1);
    }
}
