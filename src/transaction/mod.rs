//! Write-transaction state machine and registry.
//!
//! Every replicated write is tracked by a [`Txn`]: leader transactions
//! on the node that originated the write, follower transactions
//! everywhere the committed log entry is applied. The [`TxnRegistry`]
//! enforces the one-writer-per-database rule.

mod errors;
mod registry;
mod state;
mod txn;

pub use errors::{TxnError, TxnResult};
pub use registry::TxnRegistry;
pub use state::TxnState;
pub use txn::Txn;
