//! Consensus interface.
//!
//! The replication layer treats consensus as a black box behind
//! [`RaftHandle`]: submit a command, learn whether it committed, ask
//! about role and log position. [`LocalCluster`] is a deterministic
//! in-process implementation used by tests and local deployments.

mod errors;
mod local;

pub use errors::{RaftError, RaftResult};
pub use local::{LocalCluster, LocalNode};

use std::time::Duration;

/// Consensus role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
}

/// Sink for committed log entries, implemented by the replication FSM.
pub trait LogApplier: Send + Sync {
    /// Apply the committed entry at `index`. Entries arrive exactly
    /// once, in index order.
    fn apply_entry(&self, index: u64, data: &[u8]);
}

/// Handle on the consensus engine, as seen by one node.
pub trait RaftHandle: Send + Sync {
    /// Submit an entry and wait for it to commit and be applied
    /// locally. Returns the entry's log index.
    fn apply(&self, data: &[u8], timeout: Duration) -> RaftResult<u64>;

    fn role(&self) -> RaftRole;

    /// Index of the last entry in the local log.
    fn last_index(&self) -> u64;
}
