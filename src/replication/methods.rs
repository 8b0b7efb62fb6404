//! Leader-side replication hooks.
//!
//! The application drives its writes through these hooks instead of
//! the engine directly: each hook turns the local write step into a
//! command, submits it through consensus, and lets the FSM perform the
//! actual engine work once the command commits. When a submission
//! fails mid-transaction the hooks degrade gracefully: the transaction
//! is parked as stale so trailing hook calls no-op, and a surrogate
//! follower transaction is left behind for the next leader to roll
//! back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::config::ReplicationConfig;
use super::errors::{HookError, HookResult};
use super::sync::{HookGuard, HookSync};
use crate::command::{self, Command};
use crate::connection::ConnRegistry;
use crate::engine::{Connection, ConnectionId, FrameBatch};
use crate::observability::Logger;
use crate::raft::{RaftError, RaftHandle, RaftRole};
use crate::transaction::{Txn, TxnRegistry, TxnState};

pub struct Methods {
    raft: Arc<dyn RaftHandle>,
    connections: Arc<ConnRegistry>,
    transactions: Arc<TxnRegistry>,
    sync: Arc<HookSync>,
    apply_timeout: Duration,
    /// Stale transactions by connection, so trailing hook calls on a
    /// degraded connection can be recognized and ignored.
    stale: Mutex<HashMap<ConnectionId, Arc<Txn>>>,
}

impl Methods {
    pub fn new(
        raft: Arc<dyn RaftHandle>,
        connections: Arc<ConnRegistry>,
        transactions: Arc<TxnRegistry>,
        sync: Arc<HookSync>,
        config: &ReplicationConfig,
    ) -> Self {
        Self {
            raft,
            connections,
            transactions,
            sync,
            apply_timeout: config.apply_timeout(),
            stale: Mutex::new(HashMap::new()),
        }
    }

    /// Hook invoked when a write transaction starts on `conn`.
    pub fn begin(&self, conn: &Arc<Connection>) -> HookResult<()> {
        // Write transactions on one connection never nest; an existing
        // transaction here is a bug in the calling code.
        if let Some(txn) = self.transactions.get_by_conn(conn) {
            panic!(
                "connection {} already has transaction {}",
                conn.id(),
                txn.id()
            );
        }
        self.stale.lock().unwrap().remove(&conn.id());

        if self.raft.role() != RaftRole::Leader {
            return Err(HookError::NotLeader);
        }

        let name = self.connections.filename_of_leader(conn);
        let guard = self.sync.enter();

        // The last log index doubles as the transaction id: it is
        // unique (the registry panics otherwise) and totally ordered
        // with the log. Reading it under the gate keeps concurrent
        // hooks on other databases from deriving the same id.
        let txn_id = self.raft.last_index();
        let siblings = self.connections.leaders(&name);
        let txn = match self.transactions.add_leader(conn, txn_id, &siblings) {
            Some(txn) => txn,
            None => return Err(HookError::Busy),
        };

        // Lazily open the follower connection cluster-wide.
        if !self.connections.has_follower(&name) {
            if let Err(e) = self.submit(&guard, &Command::Open { name: name.clone() }) {
                // Nothing about this transaction was replicated yet,
                // and Open is idempotent if it did commit.
                self.transactions.remove(txn.id());
                return Err(e);
            }
        }

        if let Err(e) = self.finish_dangling_follower(&guard, &name) {
            // The leftover could not be rolled back; park our own
            // transaction so the trailing hooks no-op.
            self.mark_stale(conn, &txn);
            return Err(e);
        }

        if let Err(e) = self.submit(
            &guard,
            &Command::Begin {
                txn_id,
                name: name.clone(),
            },
        ) {
            // The command may still have committed. If our local FSM
            // ran it, it did so everywhere; leave a follower behind so
            // the next leader finds and rolls back the leftover.
            let begun = txn.begun();
            self.mark_stale(conn, &txn);
            if begun {
                self.add_surrogate(&name, txn_id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Hook invoked when `conn` flushes a batch of WAL frames.
    pub fn wal_frames(&self, conn: &Arc<Connection>, frames: &FrameBatch) -> HookResult<()> {
        let txn = match self.hook_txn(conn) {
            Some(txn) => txn,
            None => return Ok(()), // stale, trailing call
        };

        if self.raft.role() != RaftRole::Leader {
            // The transaction began cluster-wide; degrade so the
            // caller's rollback no-ops here and the next leader rolls
            // the leftover back everywhere.
            self.degrade(conn, &txn);
            return Err(HookError::NotLeader);
        }
        self.check_no_follower_txn(conn);

        let name = self.connections.filename_of_leader(conn);
        let guard = self.sync.enter();
        if let Err(e) = self.submit(
            &guard,
            &Command::Frames {
                txn_id: txn.id(),
                name,
                frames: frames.clone(),
            },
        ) {
            self.degrade(conn, &txn);
            return Err(e);
        }
        Ok(())
    }

    /// Hook invoked when the transaction on `conn` rolls back.
    pub fn undo(&self, conn: &Arc<Connection>) -> HookResult<()> {
        let txn = match self.hook_txn(conn) {
            Some(txn) => txn,
            None => return Ok(()), // stale, trailing call
        };

        if self.raft.role() != RaftRole::Leader {
            return Err(HookError::NotLeader);
        }
        self.check_no_follower_txn(conn);

        let guard = self.sync.enter();
        if let Err(e) = self.submit(&guard, &Command::Undo { txn_id: txn.id() }) {
            self.degrade(conn, &txn);
            return Err(e);
        }
        Ok(())
    }

    /// Hook invoked when the transaction on `conn` ends.
    pub fn end(&self, conn: &Arc<Connection>) -> HookResult<()> {
        let txn = match self.transactions.get_by_conn(conn) {
            Some(txn) => txn,
            None => {
                // Trailing End after a degrade: the stale marker has
                // served its purpose.
                if self.stale.lock().unwrap().remove(&conn.id()).is_some() {
                    return Ok(());
                }
                panic!("no ongoing transaction for connection {}", conn.id());
            }
        };

        if self.raft.role() != RaftRole::Leader {
            // An End command cannot commit from here. Release the
            // write slot locally and leave a follower behind so the
            // next leader finishes the transaction everywhere.
            self.degrade(conn, &txn);
            return Err(HookError::NotLeader);
        }
        self.check_no_follower_txn(conn);

        let guard = self.sync.enter();
        if let Err(e) = self.submit(&guard, &Command::End { txn_id: txn.id() }) {
            if txn.ended() {
                // The local FSM ran the command before the failure
                // came back: the transaction completed and is already
                // out of the registry.
                return Err(e);
            }
            // No further hook will run for this transaction; finish
            // it here and leave a follower for the next leader.
            if let Err(end_err) = txn.end() {
                return Err(HookError::Replication(end_err.to_string()));
            }
            let name = self.connections.filename_of_leader(conn);
            self.transactions.remove(txn.id());
            self.add_surrogate(&name, txn.id());
            return Err(e);
        }
        Ok(())
    }

    /// Hook invoked when `conn` wants to checkpoint its WAL.
    pub fn checkpoint(&self, conn: &Arc<Connection>) -> HookResult<()> {
        if self.raft.role() != RaftRole::Leader {
            return Err(HookError::NotLeader);
        }
        let name = self.connections.filename_of_leader(conn);
        let guard = self.sync.enter();
        self.submit(&guard, &Command::Checkpoint { name })
    }

    /// The transaction a mid-flight hook call refers to, or `None` if
    /// the connection was degraded and the call should no-op.
    fn hook_txn(&self, conn: &Arc<Connection>) -> Option<Arc<Txn>> {
        if let Some(txn) = self.transactions.get_by_conn(conn) {
            return Some(txn);
        }
        if self.stale.lock().unwrap().contains_key(&conn.id()) {
            return None;
        }
        panic!("no ongoing transaction for connection {}", conn.id());
    }

    /// Roll back and finish a follower transaction left behind on this
    /// node by a deposed leader, before starting a new transaction on
    /// the same database.
    fn finish_dangling_follower(&self, guard: &HookGuard, name: &str) -> HookResult<()> {
        let follower = match self.connections.follower(name) {
            Some(f) => f,
            None => return Ok(()),
        };
        let dangling = match self.transactions.get_by_conn(&follower) {
            Some(t) => t,
            None => return Ok(()),
        };

        Logger::info(
            "ROLLBACK_DANGLING_TXN",
            &[
                ("name", name),
                ("state", &dangling.state().to_string()),
                ("txn", &dangling.id().to_string()),
            ],
        );

        // A transaction whose commit frames already replicated is
        // durable, and one that already rolled back has nothing left
        // to undo (`Written -> Undone` and `Undone -> Undone` are both
        // illegal). Either way only the End is missing.
        if matches!(dangling.state(), TxnState::Pending | TxnState::Writing) {
            self.submit(guard, &Command::Undo { txn_id: dangling.id() })?;
        }
        self.submit(guard, &Command::End { txn_id: dangling.id() })?;
        Ok(())
    }

    /// Park a transaction whose submission outcome is unknown: roll it
    /// back locally, release the write slot, and index it so trailing
    /// hook calls on its connection no-op.
    fn mark_stale(&self, conn: &Arc<Connection>, txn: &Arc<Txn>) {
        if let Err(e) = txn.mark_stale() {
            // A wedged write slot cannot be recovered from.
            panic!("failed to mark transaction {} stale: {e}", txn.id());
        }
        Logger::warn(
            "TXN_STALE",
            &[("conn", &conn.id().to_string()), ("txn", &txn.id().to_string())],
        );
        self.stale.lock().unwrap().insert(conn.id(), Arc::clone(txn));
        self.transactions.remove(txn.id());
    }

    fn degrade(&self, conn: &Arc<Connection>, txn: &Arc<Txn>) {
        let name = self.connections.filename_of_leader(conn);
        let id = txn.id();
        self.mark_stale(conn, txn);
        self.add_surrogate(&name, id);
    }

    /// Leave a follower transaction with the given id behind, standing
    /// in for a degraded leader transaction that other nodes know
    /// about. The next leader will find and finish it.
    fn add_surrogate(&self, name: &str, id: u64) {
        let follower = match self.connections.follower(name) {
            Some(f) => f,
            None => panic!("no follower connection for '{name}'"),
        };
        let txn = self.transactions.add_follower(&follower, id);
        if let Err(e) = txn.begin() {
            panic!("failed to begin surrogate follower transaction {id}: {e}");
        }
    }

    /// A follower write transaction on the database of a leader
    /// connection mid-hook means the log and the hooks disagree.
    fn check_no_follower_txn(&self, conn: &Connection) {
        let name = self.connections.filename_of_leader(conn);
        if let Some(follower) = self.connections.follower(&name) {
            if let Some(txn) = self.transactions.get_by_conn(&follower) {
                panic!("detected follower write transaction {txn}");
            }
        }
    }

    fn submit(&self, guard: &HookGuard, command: &Command) -> HookResult<()> {
        let data = command::encode(command, guard.nonce());
        match self.raft.apply(&data, self.apply_timeout) {
            Ok(_) => Ok(()),
            Err(e) => {
                Logger::warn(
                    "HOOK_APPLY_FAILED",
                    &[("cmd", command.kind()), ("error", &e.to_string())],
                );
                match e {
                    RaftError::NotLeader | RaftError::LeadershipLost => Err(HookError::NotLeader),
                    RaftError::Apply(msg) => Err(HookError::Replication(msg)),
                }
            }
        }
    }
}
