use thiserror::Error;

use crate::command::CommandError;
use crate::engine::EngineError;
use crate::transaction::{TxnError, TxnState};

/// Errors returned by the leader-side replication hooks.
///
/// Hooks never panic on runtime conditions; callers retry `Busy`,
/// redirect on `NotLeader`, and treat `Replication` as a failed write.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("not the leader")]
    NotLeader,

    #[error("a write transaction is already in progress")]
    Busy,

    #[error("replication failed: {0}")]
    Replication(String),
}

pub type HookResult<T> = Result<T, HookError>;

/// Failures while applying a committed log entry.
///
/// All of these are fatal in production: the log is the source of
/// truth, and a node that cannot apply it is corrupt. They surface as
/// errors only when panics are disabled for tests.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("corrupted command data: {0}")]
    Corrupt(#[from] CommandError),

    #[error("no transaction with id {0}")]
    NoSuchTransaction(u64),

    #[error("transaction {0} exists but is not a leader transaction")]
    NotLeaderTransaction(u64),

    #[error("dangling leader transaction {txn_id} on '{name}'")]
    DanglingLeader { txn_id: u64, name: String },

    #[error("no follower connection for '{0}'")]
    NoFollower(String),

    #[error("checkpoint of '{name}' with transaction {txn_id} in flight")]
    CheckpointBlocked { name: String, txn_id: u64 },

    #[error("{remaining} frames left in the WAL of '{name}' after checkpoint")]
    CheckpointIncomplete { name: String, remaining: u32 },

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors from taking or restoring a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A write transaction is past the point where it could be
    /// re-created from file state alone. Retryable.
    #[error("transaction {txn_id} is in progress ({state})")]
    Busy { txn_id: u64, state: TxnState },

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error("snapshot i/o: {0}")]
    Io(#[from] std::io::Error),
}
