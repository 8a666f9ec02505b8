//! Error types for the recovery engine.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for recovery operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Errors raised by the lower-level building blocks of the recovery engine.
///
/// The [`RecoveryManager`](crate::RecoveryManager) façade never surfaces these
/// to its callers; it logs them and keeps going.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Filesystem operation failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A controller payload could not be interpreted
    #[error("Malformed command: {0}")]
    MalformedCommand(String),
}

impl RecoveryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A violated recovery threshold constraint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_count must be a positive number, got {0}")]
    MaxCount(i64),

    #[error("window_in_min must be a positive number, got {0}")]
    Window(i64),

    #[error("retry_gap must be a positive number and at least 1, got {0}")]
    RetryGap(i64),

    #[error("retry_gap ({retry_gap}) must be smaller than window_in_min ({window_in_min})")]
    RetryGapExceedsWindow { retry_gap: i64, window_in_min: i64 },

    #[error("max_lifetime_count ({max_lifetime_count}) must be at least 0 and >= max_count ({max_count})")]
    LifetimeCount {
        max_lifetime_count: i64,
        max_count: i64,
    },
}
