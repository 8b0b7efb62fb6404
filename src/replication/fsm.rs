//! The replicated state machine.
//!
//! Every node applies committed log entries here, in order. The FSM
//! drives follower transactions against the local engine so that the
//! database and WAL files on every node stay byte-identical; on the
//! node that originated a write it drives the leader transaction
//! registered by the hooks instead.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::errors::{FsmError, SnapshotError};
use super::sync::HookSync;
use crate::command::{self, Command};
use crate::connection::ConnRegistry;
use crate::engine::{CheckpointMode, Connection, FrameBatch};
use crate::observability::Logger;
use crate::transaction::{Txn, TxnRegistry, TxnState};

pub struct Fsm {
    connections: Arc<ConnRegistry>,
    transactions: Arc<TxnRegistry>,
    sync: Arc<HookSync>,
    last_applied: AtomicU64,
    /// Whether a failed apply panics. Always on in production; tests
    /// turn it off to assert on the error.
    panic_on_failure: AtomicBool,
}

impl Fsm {
    pub fn new(
        connections: Arc<ConnRegistry>,
        transactions: Arc<TxnRegistry>,
        sync: Arc<HookSync>,
    ) -> Self {
        Self {
            connections,
            transactions,
            sync,
            last_applied: AtomicU64::new(0),
            panic_on_failure: AtomicBool::new(true),
        }
    }

    pub fn connections(&self) -> &Arc<ConnRegistry> {
        &self.connections
    }

    pub fn transactions(&self) -> &Arc<TxnRegistry> {
        &self.transactions
    }

    /// Index of the last successfully applied entry.
    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn set_panic_on_failure(&self, on: bool) {
        self.panic_on_failure.store(on, Ordering::SeqCst);
    }

    /// Apply the committed entry at `index`.
    pub fn apply(&self, index: u64, data: &[u8]) -> Result<(), FsmError> {
        match self.try_apply(index, data) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.panic_on_failure.load(Ordering::SeqCst) {
                    Logger::fatal(
                        "FSM_APPLY_FAILED",
                        &[("index", &index.to_string()), ("error", &e.to_string())],
                    );
                    panic!("apply of log entry {index} failed: {e}");
                }
                Logger::error(
                    "FSM_APPLY_FAILED",
                    &[("index", &index.to_string()), ("error", &e.to_string())],
                );
                Err(e)
            }
        }
    }

    fn try_apply(&self, index: u64, data: &[u8]) -> Result<(), FsmError> {
        let (command, origin) = command::decode(data)?;

        // A local hook mid-submission owns the registries; hold back
        // entries from other leaders until it finishes.
        self.sync.wait_allowed(origin);

        match &command {
            Command::Open { name } => self.apply_open(name)?,
            Command::Begin { txn_id, name } => self.apply_begin(*txn_id, name)?,
            Command::Frames {
                txn_id,
                name,
                frames,
            } => self.apply_frames(*txn_id, name, frames)?,
            Command::Undo { txn_id } => self.apply_undo(*txn_id)?,
            Command::End { txn_id } => self.apply_end(*txn_id)?,
            Command::Checkpoint { name } => self.apply_checkpoint(name)?,
        }

        self.last_applied.store(index, Ordering::SeqCst);
        Logger::trace(
            "FSM_APPLIED",
            &[("cmd", command.kind()), ("index", &index.to_string())],
        );
        Ok(())
    }

    fn apply_open(&self, name: &str) -> Result<(), FsmError> {
        // Idempotent: replays and lagging logs may open twice.
        if self.connections.has_follower(name) {
            return Ok(());
        }
        self.connections.open_follower(name)?;
        Ok(())
    }

    fn apply_begin(&self, txn_id: u64, name: &str) -> Result<(), FsmError> {
        let txn = match self.transactions.get_by_id(txn_id) {
            Some(txn) => {
                // The id is known, so the transaction originated on
                // this node and must be a leader transaction.
                if !txn.is_leader() {
                    return Err(FsmError::NotLeaderTransaction(txn_id));
                }
                txn
            }
            None => {
                // A fresh follower transaction. A leader transaction
                // still registered for this database means a deposed
                // leader never released the write slot, which should
                // have been rolled back before this entry was logged.
                for conn in self.connections.leaders(name) {
                    if let Some(dangling) = self.transactions.get_by_conn(&conn) {
                        return Err(FsmError::DanglingLeader {
                            txn_id: dangling.id(),
                            name: name.to_string(),
                        });
                    }
                }
                let follower = self.follower(name)?;
                self.transactions.add_follower(&follower, txn_id)
            }
        };
        txn.begin()?;
        Ok(())
    }

    fn apply_frames(&self, txn_id: u64, name: &str, frames: &FrameBatch) -> Result<(), FsmError> {
        let _ = self.follower(name)?;
        let txn = self
            .transactions
            .get_by_id(txn_id)
            .ok_or(FsmError::NoSuchTransaction(txn_id))?;
        txn.frames(frames)?;
        Ok(())
    }

    fn apply_undo(&self, txn_id: u64) -> Result<(), FsmError> {
        let txn = self
            .transactions
            .get_by_id(txn_id)
            .ok_or(FsmError::NoSuchTransaction(txn_id))?;
        txn.undo()?;
        Ok(())
    }

    fn apply_end(&self, txn_id: u64) -> Result<(), FsmError> {
        let txn = self
            .transactions
            .get_by_id(txn_id)
            .ok_or(FsmError::NoSuchTransaction(txn_id))?;
        txn.end()?;
        self.transactions.remove(txn_id);
        Ok(())
    }

    fn apply_checkpoint(&self, name: &str) -> Result<(), FsmError> {
        let follower = self.follower(name)?;

        // Leader connections first, so the checkpoint prefers the
        // handle the application writes through when one is open.
        let mut conns = self.connections.leaders(name);
        conns.push(Arc::clone(&follower));

        for candidate in &conns {
            if let Some(txn) = self.transactions.get_by_conn(candidate) {
                // A checkpoint must never be logged while a write
                // transaction is in flight.
                return Err(FsmError::CheckpointBlocked {
                    name: name.to_string(),
                    txn_id: txn.id(),
                });
            }
        }

        let (remaining, checkpointed) = conns[0].checkpoint(CheckpointMode::Truncate)?;
        if remaining != 0 {
            return Err(FsmError::CheckpointIncomplete {
                name: name.to_string(),
                remaining,
            });
        }
        Logger::info(
            "FSM_CHECKPOINT",
            &[("frames", &checkpointed.to_string()), ("name", name)],
        );
        Ok(())
    }

    fn follower(&self, name: &str) -> Result<Arc<Connection>, FsmError> {
        self.connections
            .follower(name)
            .ok_or_else(|| FsmError::NoFollower(name.to_string()))
    }

    /// Capture a point-in-time snapshot of every replicated database.
    ///
    /// Refuses with a retryable `Busy` if any transaction has moved
    /// past the fresh `Pending` point: its WAL position could not be
    /// re-created on restore. A `Pending` transaction's id rides along
    /// and is re-registered when the snapshot is restored.
    pub fn snapshot(&self) -> Result<FsmSnapshot, SnapshotError> {
        let mut databases = Vec::new();
        for name in self.connections.filenames_of_followers() {
            databases.push(self.snapshot_database(&name)?);
        }
        Ok(FsmSnapshot {
            index: self.last_applied(),
            databases,
        })
    }

    fn snapshot_database(&self, name: &str) -> Result<DatabaseSnapshot, SnapshotError> {
        let follower = self.connections.follower(name).ok_or_else(|| {
            SnapshotError::Corrupt(format!("no follower connection for '{name}'"))
        })?;

        let mut txn_id = None;
        let mut conns = self.connections.leaders(name);
        conns.push(Arc::clone(&follower));
        for conn in &conns {
            if let Some(txn) = self.transactions.get_by_conn(conn) {
                if txn.state() != TxnState::Pending {
                    return Err(SnapshotError::Busy {
                        txn_id: txn.id(),
                        state: txn.state(),
                    });
                }
                txn_id = Some(txn.id());
            }
        }

        let (database, wal) = follower.snapshot_bytes()?;
        Ok(DatabaseSnapshot {
            filename: name.to_string(),
            database,
            wal,
            txn_id,
        })
    }

    /// Replace all local state with the contents of a snapshot.
    pub fn restore<R: Read>(&self, reader: R) -> Result<(), SnapshotError> {
        let mut reader = BufReader::new(reader);

        let index = read_u64(&mut reader)?;
        self.last_applied.store(index, Ordering::SeqCst);
        Logger::info("FSM_RESTORE", &[("index", &index.to_string())]);

        loop {
            if reader.fill_buf()?.is_empty() {
                break;
            }
            self.restore_database(&mut reader)?;
        }
        Ok(())
    }

    fn restore_database<R: Read>(&self, reader: &mut BufReader<R>) -> Result<(), SnapshotError> {
        let database = read_sized(reader)?;
        let wal = read_sized(reader)?;

        let filename = read_cstr(reader)?
            .ok_or_else(|| SnapshotError::Corrupt("unterminated database name".into()))?;

        // Txn id field: decimal digits, empty when none, terminated by
        // NUL or end of stream for the last database.
        let txn_id = match read_cstr_or_eof(reader)? {
            s if s.is_empty() => None,
            s => Some(
                s.parse::<u64>()
                    .map_err(|_| SnapshotError::Corrupt(format!("bad transaction id '{s}'")))?,
            ),
        };

        // Overwriting a database while a local leader connection is
        // open would yank the file from under the application.
        let leaders = self.connections.leaders(&filename);
        if !leaders.is_empty() {
            panic!(
                "restore of '{filename}' with {} open leader connections",
                leaders.len()
            );
        }

        if let Some(follower) = self.connections.follower(&filename) {
            if let Some(txn) = self.transactions.get_by_conn(&follower) {
                Logger::warn(
                    "RESTORE_DROP_TXN",
                    &[("name", filename.as_str()), ("txn", &txn.id().to_string())],
                );
                self.transactions.remove(txn.id());
            }
            self.connections.del_follower(&filename);
        }

        self.connections.restore(&filename, &database, &wal)?;
        let follower = self.connections.open_follower(&filename)?;

        if let Some(id) = txn_id {
            let txn = self.transactions.add_follower(&follower, id);
            txn.begin()?;
        }
        Ok(())
    }
}

impl crate::raft::LogApplier for Fsm {
    fn apply_entry(&self, index: u64, data: &[u8]) {
        // With panics enabled a failure never returns. Tests that
        // disable panics call apply() directly to assert on the error.
        let _ = self.apply(index, data);
    }
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, SnapshotError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_sized<R: Read>(reader: &mut R) -> Result<Vec<u8>, SnapshotError> {
    let size = read_u64(reader)?;
    let mut data = vec![0u8; size as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}

fn read_cstr<R: Read>(reader: &mut BufReader<R>) -> Result<Option<String>, SnapshotError> {
    let mut buf = Vec::new();
    reader.read_until(0, &mut buf)?;
    if buf.pop() != Some(0) {
        return Ok(None);
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| SnapshotError::Corrupt("non-UTF-8 string".into()))
}

fn read_cstr_or_eof<R: Read>(reader: &mut BufReader<R>) -> Result<String, SnapshotError> {
    let mut buf = Vec::new();
    reader.read_until(0, &mut buf)?;
    if buf.last() == Some(&0) {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| SnapshotError::Corrupt("non-UTF-8 string".into()))
}

/// A captured snapshot, ready to be persisted.
#[derive(Debug)]
pub struct FsmSnapshot {
    index: u64,
    databases: Vec<DatabaseSnapshot>,
}

#[derive(Debug)]
struct DatabaseSnapshot {
    filename: String,
    database: Vec<u8>,
    wal: Vec<u8>,
    txn_id: Option<u64>,
}

impl FsmSnapshot {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Write the snapshot wire format to `sink`.
    pub fn persist<W: Write>(&self, sink: &mut W) -> Result<(), SnapshotError> {
        sink.write_all(&self.index.to_le_bytes())?;

        for (i, db) in self.databases.iter().enumerate() {
            sink.write_all(&(db.database.len() as u64).to_le_bytes())?;
            sink.write_all(&db.database)?;
            sink.write_all(&(db.wal.len() as u64).to_le_bytes())?;
            sink.write_all(&db.wal)?;
            sink.write_all(db.filename.as_bytes())?;
            sink.write_all(&[0])?;
            if let Some(id) = db.txn_id {
                sink.write_all(id.to_string().as_bytes())?;
            }
            // The last database's txn id is terminated by end of
            // stream instead of NUL.
            if i + 1 < self.databases.len() {
                sink.write_all(&[0])?;
            }
        }
        Ok(())
    }
}
