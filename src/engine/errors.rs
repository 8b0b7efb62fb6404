//! Engine error types

use std::io;

use thiserror::Error;

use crate::wal::WalError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the embedded page-store engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another connection holds the database's write slot.
    #[error("database is busy: write slot held by another connection")]
    Busy,

    /// A write primitive was invoked by a connection that does not
    /// hold the write slot. The transaction state machine should make
    /// this impossible; hitting it is a bug in the caller.
    #[error("connection does not hold the write slot")]
    NotWriter,

    #[error("invalid database name '{0}': must be a bare filename")]
    InvalidName(String),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl EngineError {
    pub fn io(path: &std::path::Path, source: io::Error) -> Self {
        EngineError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
