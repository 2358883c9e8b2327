//! Structured logging setup.
//!
//! Library code logs through `tracing` macros with structured fields. The
//! binary calls [`init_with_debug`] once to install a subscriber that writes
//! to `~/.verity/verity.log`, truncated on startup.
//!
//! Levels:
//! - ERROR: failures that end an operation (retries exhausted, load errors)
//! - WARN: recoverable conditions (worker crash, memory pressure, timeouts)
//! - INFO: lifecycle (start, stop, completion, cache clear)
//! - DEBUG: per-task and per-load traces
//! - TRACE: per-tick scheduler state
//!
//! Debug mode can be enabled with `--debug` or `VERITY_DEBUG=1`. `VERITY_LOG`
//! takes a full `EnvFilter` directive and overrides both.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub const DEBUG_ENV: &str = "VERITY_DEBUG";
pub const FILTER_ENV: &str = "VERITY_LOG";

/// Initialize logging at INFO level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Falls back to stderr when the home directory is unavailable. Calling this
/// more than once keeps the first subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_flag(DEBUG_ENV);
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let level = if debug_enabled { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("verity={level}")));

    let writer = match open_log_file() {
        Some(file) => BoxMakeWriter::new(Mutex::new(file)),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn open_log_file() -> Option<File> {
    let dir = crate::config::Config::verity_dir().ok()?;
    std::fs::create_dir_all(&dir).ok()?;
    File::create(dir.join("verity.log")).ok()
}
