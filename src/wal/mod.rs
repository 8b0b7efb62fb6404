//! Write-ahead log file format and I/O.
//!
//! Replication ships WAL frames, not SQL: every committed write is a
//! batch of page images appended here, later folded into the database
//! file by a checkpoint. Frames carry CRC32 checksums and a commit
//! marker holding the database size in pages.

mod errors;
mod file;
mod record;

pub use errors::{WalError, WalResult};
pub use file::WalFile;
pub use record::{
    Frame, FrameHeader, WalHeader, FRAME_FLAG_COMMIT, FRAME_HEADER_SIZE, WAL_FORMAT_VERSION,
    WAL_HEADER_SIZE, WAL_MAGIC,
};
