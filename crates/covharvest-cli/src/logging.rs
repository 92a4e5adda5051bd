//! Structured logging setup
//!
//! - `RUST_LOG` wins when set
//! - otherwise the level follows `-q` / `-v`
//! - JSON lines when `RUST_LOG_FORMAT=json`
//!
//! Everything goes to stderr so stdout stays clean for tables and JSON.

use crate::config::Verbosity;
use tracing_subscriber::EnvFilter;

/// Whether `RUST_LOG_FORMAT` asks for JSON output
#[must_use]
pub fn json_requested() -> bool {
    std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Initialize the global subscriber; later calls are no-ops
pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.log_directive()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json_requested() {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
