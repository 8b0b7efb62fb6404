//! replidb: consensus-replicated WAL database layer.
//!
//! Replication works at the write-ahead-log level rather than the
//! statement level: every committed write transaction on the leader is
//! shipped as a batch of WAL page frames through the consensus log,
//! and every node folds the same frames into the same files. The
//! engine is a page store with leader and follower connections; the
//! consensus engine is a black box behind a trait.
//!
//! Subsystems:
//!
//! - [`wal`]: the on-disk frame format and file I/O.
//! - [`engine`]: connections, write-slot arbitration, checkpointing,
//!   hot backup and restore.
//! - [`connection`]: the registry of open connections per node.
//! - [`transaction`]: the write-transaction state machine and
//!   registry.
//! - [`command`]: the replicated command envelope.
//! - [`raft`]: the consensus interface and an in-process cluster.
//! - [`replication`]: the leader-side hooks and the state machine
//!   applied on every node.
//! - [`observability`]: structured JSON logging.

pub mod command;
pub mod connection;
pub mod engine;
pub mod observability;
pub mod raft;
pub mod replication;
pub mod transaction;
pub mod wal;
