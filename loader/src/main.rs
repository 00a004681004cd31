// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use anyhow::{Context, anyhow};
use clap::{ArgAction, Parser};
use lazyload::logger;
use log::LevelFilter;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::process;

/// Runs a static executable, loading its pages on first access.
#[derive(Debug, Parser)]
#[clap(version)]
struct Cli {
    /// Enables verbose logging, repeat for more detail
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Log level filter, overrides `--verbose`
    #[clap(long, env = "LAZYLOAD_LOG", value_parser = parse_level)]
    log: Option<LevelFilter>,
    /// Path to the executable
    executable: PathBuf,
    /// Arguments passed to the executable
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

impl Cli {
    /// The effective log level, `--log` (or its environment variable) wins over `--verbose`.
    fn level(&self) -> LevelFilter {
        self.log.unwrap_or(logger::verbosity_level(self.verbose))
    }
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    s.parse()
        .map_err(|_| format!("`{s}` is not one of off, error, warn, info, debug, trace"))
}

fn main() {
    if let Err(err) = run() {
        log::error!("{err:?}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logger::init(cli.level())
        .map_err(|err| anyhow!("failed to install logger: {err}"))?;

    let args = std::iter::once(cli.executable.clone().into_os_string())
        .chain(cli.args)
        .map(|arg| CString::new(arg.into_vec()))
        .collect::<Result<Vec<_>, _>>()
        .context("arguments must not contain NUL bytes")?;

    lazyload::init_loader().context("failed to initialize loader")?;
    let started = lazyload::execute(&cli.executable, &args)
        .with_context(|| format!("failed to run {}", cli.executable.display()))?;
    match started {}
}
