//! WAL error types

use std::io;

use thiserror::Error;

/// Result type for WAL operations
pub type WalResult<T> = Result<T, WalError>;

/// Errors raised by the WAL file layer.
///
/// Corruption is never repaired silently: a bad checksum or a torn
/// trailing frame surfaces as `Corrupt` and the caller decides whether
/// that is fatal.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL corrupt: {0}")]
    Corrupt(String),

    #[error("page size mismatch: WAL has {existing}, caller passed {requested}")]
    PageSizeMismatch { existing: u32, requested: u32 },

    #[error("frame count {requested} exceeds current WAL length {current}")]
    TruncateBeyondEnd { requested: usize, current: usize },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl WalError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: &std::path::Path, source: io::Error) -> Self {
        WalError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn corrupt(detail: impl Into<String>) -> Self {
        WalError::Corrupt(detail.into())
    }
}
