//! The embedded page-store engine.
//!
//! This is the component the replication layer drives through its WAL
//! primitives: open leader/follower connections, append frame batches,
//! undo, checkpoint, hot backup, and restore. One [`Engine`] instance
//! exists per node; per-database shared state (the write slot and the
//! WAL handle) lives inside it, keyed by database path.

mod conn;
mod errors;

pub use conn::{
    CheckpointMode, Connection, ConnectionId, ConnectionMode, FrameBatch, WalPage,
};
pub use errors::{EngineError, EngineResult};

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use conn::DbState;

use crate::wal::WalFile;

/// Per-node engine instance.
pub struct Engine {
    dbs: Mutex<HashMap<PathBuf, Arc<DbState>>>,
    next_conn_id: AtomicU64,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            dbs: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Open a leader-mode connection to `dir/name`.
    pub fn open_leader(&self, dir: &Path, name: &str) -> EngineResult<Arc<Connection>> {
        self.open(dir, name, ConnectionMode::Leader)
    }

    /// Open the follower-mode connection to `dir/name`.
    pub fn open_follower(&self, dir: &Path, name: &str) -> EngineResult<Arc<Connection>> {
        self.open(dir, name, ConnectionMode::Follower)
    }

    /// Overwrite the on-disk database and WAL files for `name`.
    ///
    /// The caller must guarantee that no open connection references
    /// these files; any cached per-database state is discarded so the
    /// next open re-reads from disk.
    pub fn restore(
        &self,
        dir: &Path,
        name: &str,
        database: &[u8],
        wal: &[u8],
    ) -> EngineResult<()> {
        validate_name(name)?;
        let db_path = dir.join(name);
        let wal_path = Connection::wal_path(dir, name);

        self.dbs.lock().unwrap().remove(&db_path);

        write_file(&db_path, database)?;
        write_file(&wal_path, wal)?;
        Ok(())
    }

    /// Drop cached state for every database under `dir`. Used by
    /// registry purge before the directory is removed.
    pub fn evict_dir(&self, dir: &Path) {
        self.dbs
            .lock()
            .unwrap()
            .retain(|path, _| !path.starts_with(dir));
    }

    fn open(
        &self,
        dir: &Path,
        name: &str,
        mode: ConnectionMode,
    ) -> EngineResult<Arc<Connection>> {
        validate_name(name)?;
        fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
        let db_path = dir.join(name);

        let db = {
            let mut dbs = self.dbs.lock().unwrap();
            match dbs.get(&db_path) {
                Some(db) => Arc::clone(db),
                None => {
                    // Create the database file so backup and restore
                    // always have something to read.
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .open(&db_path)
                        .map_err(|e| EngineError::io(&db_path, e))?;
                    let wal = WalFile::open(&Connection::wal_path(dir, name))?;
                    let db = Arc::new(DbState {
                        db_path: db_path.clone(),
                        wal: Mutex::new(wal),
                        writer: Mutex::new(None),
                    });
                    dbs.insert(db_path.clone(), Arc::clone(&db));
                    db
                }
            }
        };

        let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::SeqCst));
        Ok(Arc::new(Connection {
            id,
            name: name.to_string(),
            mode,
            db,
        }))
    }
}

fn validate_name(name: &str) -> EngineResult<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name == "."
        || name == ".."
    {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> EngineResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| EngineError::io(path, e))?;
    use std::io::Write;
    file.write_all(data).map_err(|e| EngineError::io(path, e))?;
    file.sync_data().map_err(|e| EngineError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(pages: &[(u32, u8)], page_size: u32, is_commit: bool, truncate: u32) -> FrameBatch {
        FrameBatch {
            page_size,
            pages: pages
                .iter()
                .map(|&(number, fill)| WalPage {
                    number,
                    flags: 0,
                    data: vec![fill; page_size as usize],
                })
                .collect(),
            truncate,
            is_commit,
            sync_flags: 0,
        }
    }

    #[test]
    fn test_invalid_names_rejected() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        for name in ["", "a/b", "..", "a\\b"] {
            assert!(matches!(
                engine.open_leader(dir.path(), name),
                Err(EngineError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_write_slot_is_exclusive() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        let leader = engine.open_leader(dir.path(), "app.db").unwrap();
        let follower = engine.open_follower(dir.path(), "app.db").unwrap();

        leader.begin_write().unwrap();
        assert!(leader.holds_write_lock());
        assert!(matches!(follower.begin_write(), Err(EngineError::Busy)));

        leader.end_write().unwrap();
        follower.begin_write().unwrap();
        assert!(follower.holds_write_lock());
        follower.end_write().unwrap();
    }

    #[test]
    fn test_frames_require_write_slot() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        let conn = engine.open_leader(dir.path(), "app.db").unwrap();
        let err = conn.write_frames(&batch(&[(1, 0xAA)], 512, true, 1)).unwrap_err();
        assert!(matches!(err, EngineError::NotWriter));
    }

    #[test]
    fn test_undo_truncates_to_transaction_start() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        let conn = engine.open_leader(dir.path(), "app.db").unwrap();

        conn.begin_write().unwrap();
        conn.write_frames(&batch(&[(1, 0x01)], 512, true, 1)).unwrap();
        conn.end_write().unwrap();

        conn.begin_write().unwrap();
        conn.write_frames(&batch(&[(2, 0x02)], 512, false, 0)).unwrap();
        conn.undo_write().unwrap();
        conn.end_write().unwrap();

        let (_, wal) = conn.backup().unwrap();
        // One frame from the first transaction survives.
        let expected = crate::wal::WAL_HEADER_SIZE
            + crate::wal::FRAME_HEADER_SIZE
            + 512;
        assert_eq!(wal.len(), expected);
    }

    #[test]
    fn test_checkpoint_folds_committed_frames() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        let conn = engine.open_leader(dir.path(), "app.db").unwrap();

        conn.begin_write().unwrap();
        conn.write_frames(&batch(&[(1, 0xAA), (2, 0xBB)], 512, true, 2))
            .unwrap();
        conn.end_write().unwrap();

        let (remaining, checkpointed) = conn.checkpoint(CheckpointMode::Truncate).unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(checkpointed, 2);

        let (db, wal) = conn.backup().unwrap();
        assert_eq!(db.len(), 2 * 512);
        assert_eq!(&db[0..512], &[0xAA; 512][..]);
        assert_eq!(&db[512..], &[0xBB; 512][..]);
        // WAL holds only the header after a truncate checkpoint.
        assert_eq!(wal.len(), crate::wal::WAL_HEADER_SIZE);
    }

    #[test]
    fn test_passive_checkpoint_keeps_wal() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        let conn = engine.open_leader(dir.path(), "app.db").unwrap();

        conn.begin_write().unwrap();
        conn.write_frames(&batch(&[(1, 0xAA)], 512, true, 1)).unwrap();
        conn.end_write().unwrap();

        let (_, checkpointed) = conn.checkpoint(CheckpointMode::Passive).unwrap();
        assert_eq!(checkpointed, 1);

        // The database was updated but the WAL frames stay in place.
        let (db, wal) = conn.backup().unwrap();
        assert_eq!(db, vec![0xAA; 512]);
        assert_eq!(
            wal.len(),
            crate::wal::WAL_HEADER_SIZE + crate::wal::FRAME_HEADER_SIZE + 512
        );

        // A truncate checkpoint afterwards empties it.
        conn.checkpoint(CheckpointMode::Truncate).unwrap();
        let (_, wal) = conn.backup().unwrap();
        assert_eq!(wal.len(), crate::wal::WAL_HEADER_SIZE);
    }

    #[test]
    fn test_checkpoint_busy_while_writing() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        let conn = engine.open_leader(dir.path(), "app.db").unwrap();
        conn.begin_write().unwrap();
        assert!(matches!(
            conn.checkpoint(CheckpointMode::Truncate),
            Err(EngineError::Busy)
        ));
        conn.end_write().unwrap();
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        let conn = engine.open_leader(dir.path(), "app.db").unwrap();
        conn.begin_write().unwrap();
        conn.write_frames(&batch(&[(1, 0x42)], 512, true, 1)).unwrap();
        conn.end_write().unwrap();

        let (db, wal) = conn.backup().unwrap();
        drop(conn);

        let other = TempDir::new().unwrap();
        engine.restore(other.path(), "app.db", &db, &wal).unwrap();
        let restored = engine.open_follower(other.path(), "app.db").unwrap();
        let (db2, wal2) = restored.backup().unwrap();
        assert_eq!(db, db2);
        assert_eq!(wal, wal2);
    }

    #[test]
    fn test_leader_and_follower_share_wal() {
        let engine = Engine::new();
        let dir = TempDir::new().unwrap();
        let leader = engine.open_leader(dir.path(), "app.db").unwrap();
        let follower = engine.open_follower(dir.path(), "app.db").unwrap();

        leader.begin_write().unwrap();
        leader.write_frames(&batch(&[(1, 0x99)], 512, true, 1)).unwrap();
        leader.end_write().unwrap();

        let (_, wal_via_follower) = follower.backup().unwrap();
        let (_, wal_via_leader) = leader.backup().unwrap();
        assert_eq!(wal_via_follower, wal_via_leader);
        assert!(!wal_via_follower.is_empty());
    }
}
