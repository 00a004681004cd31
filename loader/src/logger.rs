// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A logger that is safe to use from the fault handler.
//!
//! Each record is formatted into a fixed-size buffer on the stack and written to stderr with a
//! single `write` call. Overlong records are truncated.

use crate::sys;
use arrayvec::ArrayString;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};
use log::{Level, LevelFilter, Metadata, Record};

const RECORD_CAPACITY: usize = 512;

static COLORED: AtomicBool = AtomicBool::new(false);

/// Installs the logger with the given maximum level.
///
/// # Errors
///
/// Returns an error if a logger has already been installed.
pub fn init(lvl: LevelFilter) -> Result<(), log::SetLoggerError> {
    static LOGGER: Logger = Logger;

    COLORED.store(sys::stderr_is_terminal(), Ordering::Relaxed);
    log::set_logger(&LOGGER)?;
    log::set_max_level(lvl);
    Ok(())
}

/// Maps the number of `--verbose` flags to a log level.
#[must_use]
pub fn verbosity_level(num: u8) -> LevelFilter {
    match num {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        3.. => LevelFilter::Trace,
    }
}

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut buf = ArrayString::<RECORD_CAPACITY>::new();
            format_record(&mut buf, record, COLORED.load(Ordering::Relaxed));
            sys::write_stderr(buf.as_bytes());
        }
    }

    fn flush(&self) {}
}

fn format_record<const CAP: usize>(buf: &mut ArrayString<CAP>, record: &Record, colored: bool) {
    let (color, reset) = if colored {
        let color = match record.level() {
            Level::Trace => "\x1b[36m",
            Level::Debug => "\x1b[34m",
            Level::Info => "\x1b[32m",
            Level::Warn => "\x1b[33m",
            Level::Error => "\x1b[31;1m",
        };
        (color, "\x1b[0m")
    } else {
        ("", "")
    };

    // a full buffer just cuts the message short
    let _ = write!(
        Truncate(&mut *buf),
        "[{color}{:<5}{reset} {}] {}",
        record.level(),
        record.module_path_static().unwrap_or_default(),
        record.args()
    );

    if buf.try_push('\n').is_err() {
        buf.pop();
        buf.push('\n');
    }
}

/// Writes as much of each string as still fits into the buffer.
struct Truncate<'a, const CAP: usize>(&'a mut ArrayString<CAP>);

impl<const CAP: usize> Write for Truncate<'_, CAP> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut end = s.len().min(self.0.remaining_capacity());
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.0.push_str(&s[..end]);

        if end < s.len() { Err(fmt::Error) } else { Ok(()) }
    }
}
