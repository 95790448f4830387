//! Optional JSON trace log used for debugging supervisor behaviour.

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::time::UtcTime;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Environment variable that overrides the trace file location.
pub const TRACE_LOG_ENV: &str = "RUNSUP_TRACE_LOG";

/// Logging switches, usually taken from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Write the trace log.
    pub logs: bool,
    /// Force logging off even when `logs` is set.
    pub no_logs: bool,
}

pub fn tracing_log_path() -> PathBuf {
    env::var(TRACE_LOG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("runsup_trace.jsonl"))
}

#[inline]
fn tracing_enabled(config: &LogConfig) -> bool {
    config.logs && !config.no_logs
}

fn init_tracing_once(config: &LogConfig, once: &OnceLock<()>) {
    if !tracing_enabled(config) {
        return;
    }

    let _ = once.get_or_init(|| {
        let path = tracing_log_path();
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(_) => return,
        };
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(file)
            .with_current_span(false)
            .with_span_list(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Install the JSON file subscriber once per process.
pub fn init_tracing(config: &LogConfig) {
    init_tracing_once(config, &TRACING_INIT);
}
