use thiserror::Error;
use tracing::{error, warn};

/// Errors from the watcher lifecycle and its OS-facing pieces.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("keyboard hook unavailable: {0}")]
    HookUnavailable(String),

    #[error("injection failed: {0}")]
    Inject(#[from] InjectError),

    #[error("watcher thread error: {0}")]
    Thread(String),
}

/// Errors from the substitution executor (clipboard + synthetic keys).
#[derive(Error, Debug)]
pub enum InjectError {
    #[error("clipboard unavailable: {0}")]
    Clipboard(String),

    #[error("key synthesis failed: {0}")]
    KeySynthesis(String),

    #[error("text injection is not supported on this platform")]
    Unsupported,
}

/// Extension trait for silent error logging with caller location tracking.
/// Use when the operation is recoverable and the process should keep going.
pub trait ResultExt<T> {
    /// Log error with caller location and return None. Use for recoverable failures.
    fn log_err(self) -> Option<T>;
    /// Log as warning with caller location and return None. Use for expected failures.
    fn warn_on_err(self) -> Option<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                let caller = std::panic::Location::caller();
                error!(
                    error = ?err,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation failed"
                );
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                let caller = std::panic::Location::caller();
                warn!(
                    error = ?err,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation had warning"
                );
                None
            }
        }
    }
}
