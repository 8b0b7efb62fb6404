//! Consensus replication of the write-ahead log.
//!
//! Writes never touch the engine directly: the leader-side [`Methods`]
//! hooks translate them into commands and submit them through
//! consensus, and the [`Fsm`] applies each committed command on every
//! node, leaders included. The result is byte-identical database and
//! WAL files across the cluster.

mod config;
mod errors;
mod fsm;
mod methods;
mod sync;

pub use config::ReplicationConfig;
pub use errors::{FsmError, HookError, HookResult, SnapshotError};
pub use fsm::{Fsm, FsmSnapshot};
pub use methods::Methods;
pub use sync::{HookGuard, HookSync};
