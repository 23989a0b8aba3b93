//! Structured JSONL logging plus human-readable stderr output.
//!
//! Dual-output logging:
//! - **JSONL to file** (~/.autotext/logs/autotext-watcher.jsonl) - structured, greppable
//! - **Pretty to stderr** - human-readable for developers
//!
//! Initialize once in `main` and keep the returned guard alive for the
//! duration of the program; dropping it flushes and closes the log file.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Guard that must be kept alive for the duration of the program.
/// Dropping this guard will flush and close the log file.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the dual-output logging system.
///
/// Returns a guard that MUST be kept alive for the duration of the program.
pub fn init() -> LoggingGuard {
    let log_dir = log_dir();
    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!("[LOGGING] Failed to create log directory: {}", e);
    }

    let log_path = log_dir.join("autotext-watcher.jsonl");

    // Open log file with append mode
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .unwrap_or_else(|e| {
            eprintln!("[LOGGING] Failed to open log file: {}", e);
            OpenOptions::new()
                .append(true)
                .open(if cfg!(windows) { "NUL" } else { "/dev/null" })
                .unwrap_or_else(|e| panic!("Failed to open null device: {}", e))
        });

    // Non-blocking writer so slow disks never stall the keystroke thread
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file);

    // Default to info, allow override via RUST_LOG
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ureq=warn"));

    // JSONL layer for file output
    let json_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE);

    // Pretty layer for stderr
    let pretty_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .init();

    tracing::info!(
        event_type = "app_lifecycle",
        action = "started",
        log_path = %log_path.display(),
        "Watcher logging initialized"
    );

    LoggingGuard {
        _file_guard: file_guard,
    }
}

/// Log directory (~/.autotext/logs/)
fn log_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".autotext").join("logs"))
        .unwrap_or_else(|| std::env::temp_dir().join("autotext-watcher-logs"))
}

/// Path to the JSONL log file
pub fn log_path() -> PathBuf {
    log_dir().join("autotext-watcher.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_ends_with_jsonl() {
        let path = log_path();
        assert_eq!(
            path.extension().and_then(|e| e.to_str()),
            Some("jsonl"),
            "log file should be JSONL"
        );
    }
}
