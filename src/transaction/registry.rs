//! Transaction registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::txn::Txn;
use crate::engine::{Connection, ConnectionId, ConnectionMode};

struct Inner {
    txns: HashMap<u64, Arc<Txn>>,
    dry_run: bool,
}

/// Registry of in-flight transactions for one node.
///
/// At most one write transaction exists per database; registration
/// misuse (duplicate id, duplicate connection) panics.
pub struct TxnRegistry {
    inner: Mutex<Inner>,
}

impl Default for TxnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                txns: HashMap::new(),
                dry_run: false,
            }),
        }
    }

    /// Make new transactions skip engine calls and mode checks. Tests
    /// only.
    pub fn set_dry_run(&self, dry_run: bool) {
        self.inner.lock().unwrap().dry_run = dry_run;
    }

    /// Register a leader transaction on `conn`.
    ///
    /// Returns `None` if any of `siblings` (other leader connections
    /// to the same database) already has a registered transaction,
    /// since only one write transaction may run per database.
    pub fn add_leader(
        &self,
        conn: &Arc<Connection>,
        id: u64,
        siblings: &[Arc<Connection>],
    ) -> Option<Arc<Txn>> {
        let mut inner = self.inner.lock().unwrap();
        for sibling in siblings {
            if sibling.id() == conn.id() {
                continue;
            }
            if find_by_conn(&inner.txns, sibling.id()).is_some() {
                return None;
            }
        }
        if !inner.dry_run && conn.mode() != ConnectionMode::Leader {
            panic!("connection {} is not in leader mode", conn.id());
        }
        Some(add(&mut inner, Arc::clone(conn), id, true))
    }

    /// Register a follower transaction on `conn`.
    pub fn add_follower(&self, conn: &Arc<Connection>, id: u64) -> Arc<Txn> {
        let mut inner = self.inner.lock().unwrap();
        add(&mut inner, Arc::clone(conn), id, false)
    }

    pub fn get_by_id(&self, id: u64) -> Option<Arc<Txn>> {
        self.inner.lock().unwrap().txns.get(&id).cloned()
    }

    pub fn get_by_conn(&self, conn: &Connection) -> Option<Arc<Txn>> {
        let inner = self.inner.lock().unwrap();
        find_by_conn(&inner.txns, conn.id())
    }

    /// Remove a transaction. The transaction must be registered.
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.txns.remove(&id).is_none() {
            panic!("attempt to remove unregistered transaction {id}");
        }
    }

    /// Ids of all registered transactions, sorted.
    pub fn ids(&self) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<_> = inner.txns.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn find_by_conn(txns: &HashMap<u64, Arc<Txn>>, conn_id: ConnectionId) -> Option<Arc<Txn>> {
    txns.values().find(|t| t.conn().id() == conn_id).cloned()
}

fn add(inner: &mut Inner, conn: Arc<Connection>, id: u64, is_leader: bool) -> Arc<Txn> {
    if find_by_conn(&inner.txns, conn.id()).is_some() {
        panic!("connection {} already has a registered transaction", conn.id());
    }
    if inner.txns.contains_key(&id) {
        panic!("transaction id {id} already registered");
    }
    let txn = Arc::new(Txn::new(conn, id, is_leader, inner.dry_run));
    inner.txns.insert(id, Arc::clone(&txn));
    txn
}
