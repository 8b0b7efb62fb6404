//! Engine connections and write primitives.
//!
//! A [`Connection`] is an opaque handle on one database, opened in
//! either leader or follower mode. Leader and follower connections for
//! the same database on the same node share the underlying files and
//! the exclusive write slot, so a frame batch applied through either
//! one is observed by both.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::errors::{EngineError, EngineResult};
use crate::wal::{Frame, WalFile, FRAME_FLAG_COMMIT};

/// Process-unique identifier for an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication mode a connection was opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// May start write transactions; its WAL writes are intercepted
    /// by the replication hooks.
    Leader,
    /// Only replays frame batches received from committed log entries.
    Follower,
}

/// One batch of WAL frames, as passed to the frames hook and carried
/// inside a replicated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub page_size: u32,
    pub pages: Vec<WalPage>,
    /// Database size in pages after the transaction; meaningful only
    /// when `is_commit` is set.
    pub truncate: u32,
    pub is_commit: bool,
    pub sync_flags: u8,
}

/// A single page image within a [`FrameBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalPage {
    pub number: u32,
    pub flags: u16,
    pub data: Vec<u8>,
}

/// Checkpoint flavor, mirroring the engine's checkpoint vtable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Fold committed frames into the database file, leave the WAL.
    Passive,
    /// Fold committed frames and reset the WAL to empty.
    Truncate,
}

/// Shared per-database state: the write slot and the WAL handle.
///
/// All connections to the same database path on the same node hold the
/// same `DbState`.
pub(crate) struct DbState {
    pub(crate) db_path: PathBuf,
    pub(crate) wal: Mutex<WalFile>,
    pub(crate) writer: Mutex<Option<WriteLock>>,
}

/// Holder of the exclusive write slot, plus the WAL length at
/// acquisition so an undo knows where to truncate back to.
pub(crate) struct WriteLock {
    pub(crate) conn: ConnectionId,
    pub(crate) base_frames: usize,
}

/// An open handle on one database.
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) name: String,
    pub(crate) mode: ConnectionMode,
    pub(crate) db: Arc<DbState>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Database filename (no path segments).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Acquire the database's exclusive write slot.
    ///
    /// Fails with `Busy` if any connection (including this one) holds
    /// it: write transactions never nest.
    pub fn begin_write(&self) -> EngineResult<()> {
        let mut writer = self.db.writer.lock().unwrap();
        if writer.is_some() {
            return Err(EngineError::Busy);
        }
        let base_frames = self.db.wal.lock().unwrap().frame_count();
        *writer = Some(WriteLock {
            conn: self.id,
            base_frames,
        });
        Ok(())
    }

    /// Append a frame batch to the WAL. Requires the write slot.
    pub fn write_frames(&self, batch: &FrameBatch) -> EngineResult<()> {
        self.check_writer()?;

        let mut frames = Vec::with_capacity(batch.pages.len());
        let last = batch.pages.len().saturating_sub(1);
        for (i, page) in batch.pages.iter().enumerate() {
            let commit = batch.is_commit && i == last;
            let truncate = if commit { batch.truncate } else { 0 };
            let flags = if commit {
                page.flags | FRAME_FLAG_COMMIT
            } else {
                page.flags & !FRAME_FLAG_COMMIT
            };
            frames.push(Frame::new(page.number, truncate, flags, page.data.clone()));
        }

        let mut wal = self.db.wal.lock().unwrap();
        wal.append(batch.page_size, &frames)?;
        Ok(())
    }

    /// Truncate the WAL back to where this write transaction started.
    pub fn undo_write(&self) -> EngineResult<()> {
        let writer = self.db.writer.lock().unwrap();
        let base = match writer.as_ref() {
            Some(lock) if lock.conn == self.id => lock.base_frames,
            _ => return Err(EngineError::NotWriter),
        };
        let mut wal = self.db.wal.lock().unwrap();
        wal.truncate_to(base)?;
        Ok(())
    }

    /// Release the write slot.
    pub fn end_write(&self) -> EngineResult<()> {
        let mut writer = self.db.writer.lock().unwrap();
        match writer.as_ref() {
            Some(lock) if lock.conn == self.id => {
                *writer = None;
                Ok(())
            }
            _ => Err(EngineError::NotWriter),
        }
    }

    fn check_writer(&self) -> EngineResult<()> {
        match self.db.writer.lock().unwrap().as_ref() {
            Some(lock) if lock.conn == self.id => Ok(()),
            _ => Err(EngineError::NotWriter),
        }
    }

    /// Whether this connection currently holds the write slot.
    pub fn holds_write_lock(&self) -> bool {
        matches!(
            self.db.writer.lock().unwrap().as_ref(),
            Some(lock) if lock.conn == self.id
        )
    }

    /// Fold committed WAL frames into the database file.
    ///
    /// Returns `(remaining, checkpointed)`: frames left in the WAL
    /// after the checkpoint and frames moved by it. Refuses with
    /// `Busy` while a write transaction is open.
    pub fn checkpoint(&self, mode: CheckpointMode) -> EngineResult<(u32, u32)> {
        let writer = self.db.writer.lock().unwrap();
        if writer.is_some() {
            return Err(EngineError::Busy);
        }

        let mut wal = self.db.wal.lock().unwrap();
        let frames = wal.read_frames()?;
        let page_size = match wal.page_size() {
            Some(s) => s,
            None => return Ok((0, 0)),
        };

        // Only frames up to (and including) the last commit frame are
        // durable; a trailing uncommitted run stays in the WAL.
        let last_commit = frames.iter().rposition(|f| f.header.is_commit());
        let committed = match last_commit {
            Some(i) => i + 1,
            None => 0,
        };
        let remaining = frames.len() - committed;

        if committed > 0 {
            let path = &self.db.db_path;
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .map_err(|e| EngineError::io(path, e))?;
            let mut truncate = 0u32;
            for frame in &frames[..committed] {
                let offset = (frame.header.page_number as u64 - 1) * page_size as u64;
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| EngineError::io(path, e))?;
                file.write_all(&frame.data)
                    .map_err(|e| EngineError::io(path, e))?;
                if frame.header.is_commit() && frame.header.truncate > 0 {
                    truncate = frame.header.truncate;
                }
            }
            if truncate > 0 {
                file.set_len(truncate as u64 * page_size as u64)
                    .map_err(|e| EngineError::io(path, e))?;
            }
            file.sync_data().map_err(|e| EngineError::io(path, e))?;

            if mode == CheckpointMode::Truncate && remaining == 0 {
                wal.reset()?;
            }
        }

        Ok((remaining as u32, committed as u32))
    }

    /// Consistent point-in-time copy of the database and WAL bytes.
    ///
    /// Fails with `Busy` if a write transaction is open; the copy is
    /// taken under the WAL mutex so a concurrent append cannot tear
    /// it.
    pub fn backup(&self) -> EngineResult<(Vec<u8>, Vec<u8>)> {
        let writer = self.db.writer.lock().unwrap();
        if writer.is_some() {
            return Err(EngineError::Busy);
        }
        drop(writer);
        self.snapshot_bytes()
    }

    /// Copy the database and WAL bytes regardless of the write slot.
    ///
    /// Used by snapshots, which run with no frame batch in flight even
    /// when a fresh transaction holds the slot.
    pub fn snapshot_bytes(&self) -> EngineResult<(Vec<u8>, Vec<u8>)> {
        let wal = self.db.wal.lock().unwrap();

        let db_path = &self.db.db_path;
        let database = match fs::read(db_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(EngineError::io(db_path, e)),
        };
        let wal_bytes = match fs::read(wal.path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(EngineError::io(wal.path(), e)),
        };
        Ok((database, wal_bytes))
    }

    pub(crate) fn wal_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}-wal"))
    }
}
