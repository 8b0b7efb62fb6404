//! A single replicated write transaction.

use std::fmt;
use std::sync::{Arc, Mutex};

use super::errors::{TxnError, TxnResult};
use super::state::TxnState;
use crate::engine::{Connection, FrameBatch};

struct TxnInner {
    state: TxnState,
    /// Skip engine calls; state tracking only. Used by tests.
    dry_run: bool,
    /// Set once `begin` has run, meaning the write slot was acquired.
    begun: bool,
    /// Set once `end` has run, meaning the write slot was released.
    ended: bool,
}

/// A write transaction bound to one connection.
///
/// Leader transactions track a write originated by a local hook;
/// follower transactions replay committed log entries. The flavor is
/// fixed at creation.
pub struct Txn {
    id: u64,
    conn: Arc<Connection>,
    is_leader: bool,
    inner: Mutex<TxnInner>,
}

impl Txn {
    pub(super) fn new(conn: Arc<Connection>, id: u64, is_leader: bool, dry_run: bool) -> Self {
        Self {
            id,
            conn,
            is_leader,
            inner: Mutex::new(TxnInner {
                state: TxnState::Pending,
                dry_run,
                begun: false,
                ended: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().unwrap().state
    }

    pub fn is_stale(&self) -> bool {
        self.state() == TxnState::Stale
    }

    /// Whether `begin` ran, i.e. the write slot was acquired.
    pub fn begun(&self) -> bool {
        self.inner.lock().unwrap().begun
    }

    /// Whether `end` ran, i.e. the write slot was released.
    pub fn ended(&self) -> bool {
        self.inner.lock().unwrap().ended
    }

    /// Acquire the underlying connection's write slot.
    ///
    /// Legal only while `Pending`; the state does not change, the
    /// first frame batch does that.
    pub fn begin(&self) -> TxnResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != TxnState::Pending {
            return Err(TxnError::IllegalTransition {
                from: inner.state,
                to: TxnState::Pending,
            });
        }
        if !inner.dry_run {
            self.conn.begin_write()?;
        }
        inner.begun = true;
        Ok(())
    }

    /// Write a frame batch, moving to `Writing` or, for a commit
    /// batch, `Written`. An engine failure dooms the transaction.
    pub fn frames(&self, batch: &FrameBatch) -> TxnResult<()> {
        let to = if batch.is_commit {
            TxnState::Written
        } else {
            TxnState::Writing
        };
        let mut inner = self.inner.lock().unwrap();
        self.transition(&mut inner, to)?;
        if !inner.dry_run {
            if let Err(e) = self.conn.write_frames(batch) {
                inner.state = TxnState::Doomed;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Roll the write back, moving to `Undone`. An engine failure
    /// dooms the transaction.
    pub fn undo(&self) -> TxnResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.transition(&mut inner, TxnState::Undone)?;
        if !inner.dry_run {
            if let Err(e) = self.conn.undo_write() {
                inner.state = TxnState::Doomed;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Release the write slot. Not a state change; the caller removes
    /// the transaction from the registry afterwards.
    pub fn end(&self) -> TxnResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.dry_run && self.conn.holds_write_lock() {
            self.conn.end_write()?;
        }
        inner.ended = true;
        Ok(())
    }

    /// Abandon a leader transaction whose submission outcome is
    /// unknown. Rolls back and releases the write slot if held, then
    /// moves to `Stale`.
    pub fn mark_stale(&self) -> TxnResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.allows(TxnState::Stale, self.is_leader) {
            return Err(TxnError::IllegalTransition {
                from: inner.state,
                to: TxnState::Stale,
            });
        }
        if !inner.dry_run && self.conn.holds_write_lock() {
            // A transaction whose commit frames were already applied
            // is durable everywhere; keep its data and only release
            // the slot. Anything earlier is rolled back.
            if inner.state != TxnState::Written {
                self.conn.undo_write()?;
            }
            self.conn.end_write()?;
            inner.ended = true;
        }
        inner.state = TxnState::Stale;
        Ok(())
    }

    fn transition(&self, inner: &mut TxnInner, to: TxnState) -> TxnResult<()> {
        if !inner.state.allows(to, self.is_leader) {
            return Err(TxnError::IllegalTransition {
                from: inner.state,
                to,
            });
        }
        inner.state = to;
        Ok(())
    }
}

impl fmt::Display for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flavor = if self.is_leader { "leader" } else { "follower" };
        write!(f, "txn {} ({} {})", self.id, flavor, self.state())
    }
}
