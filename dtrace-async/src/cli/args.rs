//! CLI argument definitions

use clap::{ArgGroup, Parser};
use std::path::PathBuf;

use crate::session::{SessionConfig, DEFAULT_WORKERS};

#[derive(Parser, Debug)]
#[command(
    name = "dtrace-async",
    about = "Run a tracing program against a recorded capture and print its data",
    group(ArgGroup::new("program").required(true).args(["script", "script_file"])),
    after_help = "\
EXAMPLES:
    dtrace-async --replay capture.json -n 'syscall:::entry { @[execname] = count(); }'
    dtrace-async --replay capture.json -s reads.d -x quiet --json
    dtrace-async --replay capture.json -s reads.d --duration 5 --demangle"
)]
pub struct Args {
    /// Capture file to replay
    #[arg(long, value_name = "FILE")]
    pub replay: PathBuf,

    /// Program source text
    #[arg(short = 'n', value_name = "PROGRAM")]
    pub script: Option<String>,

    /// Read program source from a file
    #[arg(short = 's', value_name = "FILE")]
    pub script_file: Option<PathBuf>,

    /// Engine option, `name` or `name=value` (repeatable)
    #[arg(short = 'x', value_name = "OPT[=VAL]")]
    pub options: Vec<String>,

    /// Milliseconds between drains
    #[arg(long, default_value = "100")]
    pub interval_ms: u64,

    /// Stop after N seconds (0 = until the capture is exhausted)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Print records and aggregations as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Demangle Rust symbols in resolved addresses
    #[arg(long)]
    pub demangle: bool,

    /// Worker threads for control operations
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Split `name=value` into its parts; a bare `name` sets a boolean option
#[must_use]
pub fn parse_option(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (spec, None),
    }
}

impl Args {
    /// Session configuration; `-x` options are applied after the session
    /// opens so the engine can reject them individually
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default().with_workers(self.workers)
    }

    /// `-x` options as (name, value) pairs
    pub fn engine_options(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.options.iter().map(|spec| parse_option(spec))
    }
}
