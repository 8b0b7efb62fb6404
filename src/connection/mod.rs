//! Tracking of open leader and follower connections.
//!
//! Each node keeps exactly one follower connection per replicated
//! database and any number of leader connections. The registry owns
//! that bookkeeping plus the data directory the files live in, and is
//! the component snapshots and restores go through.

mod registry;

pub use registry::ConnRegistry;
