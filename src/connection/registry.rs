//! Connection registry.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::engine::{Connection, ConnectionId, Engine, EngineError, EngineResult};

struct Inner {
    /// Leader connections, by connection id.
    leaders: HashMap<ConnectionId, Arc<Connection>>,
    /// The one follower connection per database filename.
    followers: HashMap<String, Arc<Connection>>,
    /// Serial numbers handed out to leader connections, used to
    /// identify a connection across log lines.
    serials: HashMap<ConnectionId, u64>,
    next_serial: u64,
}

/// Registry of open connections for one node.
///
/// Mutating methods panic on misuse (double registration, removal of
/// an unknown connection): those are caller bugs, not runtime
/// conditions.
pub struct ConnRegistry {
    dir: PathBuf,
    engine: Arc<Engine>,
    inner: Mutex<Inner>,
}

impl ConnRegistry {
    pub fn new(dir: &Path, engine: Arc<Engine>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            engine,
            inner: Mutex::new(Inner {
                leaders: HashMap::new(),
                followers: HashMap::new(),
                serials: HashMap::new(),
                next_serial: 1,
            }),
        }
    }

    /// Directory holding the replicated database files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Open a new leader connection to `name` and register it.
    pub fn open_leader(&self, name: &str) -> EngineResult<Arc<Connection>> {
        let conn = self.engine.open_leader(&self.dir, name)?;
        let mut inner = self.inner.lock().unwrap();
        let serial = inner.next_serial;
        inner.next_serial += 1;
        if inner.leaders.insert(conn.id(), Arc::clone(&conn)).is_some() {
            panic!("leader connection {} registered twice", conn.id());
        }
        inner.serials.insert(conn.id(), serial);
        Ok(conn)
    }

    /// Remove a leader connection from the registry.
    pub fn del_leader(&self, conn: &Connection) {
        let mut inner = self.inner.lock().unwrap();
        if inner.leaders.remove(&conn.id()).is_none() {
            panic!("no leader connection with id {}", conn.id());
        }
        inner.serials.remove(&conn.id());
    }

    /// All registered leader connections for `name`.
    pub fn leaders(&self, name: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().unwrap();
        let mut conns: Vec<_> = inner
            .leaders
            .values()
            .filter(|c| c.name() == name)
            .cloned()
            .collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    /// Filename a registered leader connection is attached to.
    pub fn filename_of_leader(&self, conn: &Connection) -> String {
        let inner = self.inner.lock().unwrap();
        match inner.leaders.get(&conn.id()) {
            Some(c) => c.name().to_string(),
            None => panic!("no leader connection with id {}", conn.id()),
        }
    }

    /// Serial number of a registered leader connection.
    pub fn serial(&self, conn: &Connection) -> u64 {
        let inner = self.inner.lock().unwrap();
        match inner.serials.get(&conn.id()) {
            Some(serial) => *serial,
            None => panic!("no serial recorded for connection {}", conn.id()),
        }
    }

    /// Open the follower connection to `name` and register it.
    pub fn open_follower(&self, name: &str) -> EngineResult<Arc<Connection>> {
        let conn = self.engine.open_follower(&self.dir, name)?;
        let mut inner = self.inner.lock().unwrap();
        if inner
            .followers
            .insert(name.to_string(), Arc::clone(&conn))
            .is_some()
        {
            panic!("follower connection for '{name}' registered twice");
        }
        Ok(conn)
    }

    /// Remove the follower connection for `name` from the registry.
    pub fn del_follower(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.followers.remove(name).is_none() {
            panic!("no follower connection for '{name}'");
        }
    }

    pub fn follower(&self, name: &str) -> Option<Arc<Connection>> {
        self.inner.lock().unwrap().followers.get(name).cloned()
    }

    pub fn has_follower(&self, name: &str) -> bool {
        self.inner.lock().unwrap().followers.contains_key(name)
    }

    /// Filenames of all databases with a follower connection, sorted
    /// for deterministic iteration.
    pub fn filenames_of_followers(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<_> = inner.followers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Point-in-time copy of the database and WAL bytes for `name`.
    pub fn backup(&self, name: &str) -> EngineResult<(Vec<u8>, Vec<u8>)> {
        let conn = self
            .follower(name)
            .ok_or_else(|| EngineError::InvalidName(name.to_string()))?;
        conn.backup()
    }

    /// Overwrite the on-disk files for `name`.
    ///
    /// The caller must have closed every connection to the database
    /// first; the follower is expected to be re-opened afterwards.
    pub fn restore(&self, name: &str, database: &[u8], wal: &[u8]) -> EngineResult<()> {
        self.engine.restore(&self.dir, name, database, wal)
    }

    /// Drop every registered connection and delete the data directory
    /// contents. Used when a snapshot restore replaces all local state.
    pub fn purge(&self) -> EngineResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.leaders.clear();
            inner.followers.clear();
            inner.serials.clear();
        }
        self.engine.evict_dir(&self.dir);
        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| EngineError::io(&self.dir, e))?;
                    fs::remove_file(entry.path())
                        .map_err(|e| EngineError::io(&entry.path(), e))?;
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(&self.dir, e)),
        }
    }

    /// Human-readable listing of registered connections.
    pub fn dump(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::from("connections:\n");
        let mut leaders: Vec<_> = inner.leaders.values().collect();
        leaders.sort_by_key(|c| c.id());
        for conn in leaders {
            let serial = inner.serials.get(&conn.id()).copied().unwrap_or(0);
            let _ = writeln!(out, "-> {}: {} (leader, serial {})", conn.id(), conn.name(), serial);
        }
        let mut followers: Vec<_> = inner.followers.values().collect();
        followers.sort_by_key(|c| c.id());
        for conn in followers {
            let _ = writeln!(out, "-> {}: {} (follower)", conn.id(), conn.name());
        }
        out
    }
}
