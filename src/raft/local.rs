//! Deterministic in-process consensus.
//!
//! A [`LocalCluster`] maintains a single totally ordered log shared by
//! all nodes. A submitted entry commits synchronously and is delivered
//! to every connected node's applier in log order before `apply`
//! returns; disconnected nodes buffer and catch up on reconnect. This
//! makes failure scenarios scriptable: leadership changes, partitions,
//! and submissions that fail before or after commit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::errors::{RaftError, RaftResult};
use super::{LogApplier, RaftHandle, RaftRole};

struct NodeState {
    applier: Option<Arc<dyn LogApplier>>,
    connected: bool,
    /// Number of log entries already delivered to this node.
    applied: usize,
}

struct ClusterState {
    log: Vec<Vec<u8>>,
    nodes: Vec<NodeState>,
    leader: Option<usize>,
    fail_next: Option<InjectedFailure>,
}

struct InjectedFailure {
    error: RaftError,
    /// Whether the entry still commits before the error is returned.
    commit: bool,
}

/// Shared cluster fixture.
pub struct LocalCluster {
    state: Arc<Mutex<ClusterState>>,
    size: usize,
}

impl LocalCluster {
    /// Create a cluster of `size` nodes, all connected, with no
    /// leader elected yet.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "cluster needs at least one node");
        let nodes = (0..size)
            .map(|_| NodeState {
                applier: None,
                connected: true,
                applied: 0,
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                log: Vec::new(),
                nodes,
                leader: None,
                fail_next: None,
            })),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The consensus handle for node `index`.
    pub fn handle(&self, index: usize) -> Arc<LocalNode> {
        assert!(index < self.size, "no node {index}");
        Arc::new(LocalNode {
            state: Arc::clone(&self.state),
            index,
        })
    }

    /// Attach the applier that receives committed entries on `index`.
    /// Pending entries are delivered immediately.
    pub fn set_applier(&self, index: usize, applier: Arc<dyn LogApplier>) {
        let mut state = self.state.lock().unwrap();
        state.nodes[index].applier = Some(applier);
        deliver(&mut state, index);
    }

    /// Declare node `index` the leader.
    pub fn set_leader(&self, index: usize) {
        assert!(index < self.size, "no node {index}");
        self.state.lock().unwrap().leader = Some(index);
    }

    /// Cut node `index` off: it receives no further entries and no
    /// longer counts towards the majority.
    pub fn disconnect(&self, index: usize) {
        self.state.lock().unwrap().nodes[index].connected = false;
    }

    /// Reconnect node `index` and deliver everything it missed.
    pub fn reconnect(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        state.nodes[index].connected = true;
        deliver(&mut state, index);
    }

    /// Make the next `apply` on any node fail with `error`. When
    /// `commit` is set the entry still commits and is applied before
    /// the error is returned, modeling a failure after the commit
    /// point.
    pub fn fail_next_apply(&self, error: RaftError, commit: bool) {
        self.state.lock().unwrap().fail_next = Some(InjectedFailure { error, commit });
    }

    /// Number of committed entries.
    pub fn committed(&self) -> u64 {
        self.state.lock().unwrap().log.len() as u64
    }
}

/// One node's view of a [`LocalCluster`].
pub struct LocalNode {
    state: Arc<Mutex<ClusterState>>,
    index: usize,
}

impl RaftHandle for LocalNode {
    fn apply(&self, data: &[u8], _timeout: Duration) -> RaftResult<u64> {
        let mut state = self.state.lock().unwrap();
        if state.leader != Some(self.index) {
            return Err(RaftError::NotLeader);
        }

        if let Some(failure) = state.fail_next.take() {
            if failure.commit {
                commit(&mut state, data);
            }
            return Err(failure.error);
        }

        let connected = state.nodes.iter().filter(|n| n.connected).count();
        if connected * 2 <= state.nodes.len() {
            return Err(RaftError::LeadershipLost);
        }

        let index = commit(&mut state, data);
        Ok(index)
    }

    fn role(&self) -> RaftRole {
        let state = self.state.lock().unwrap();
        if state.leader == Some(self.index) {
            RaftRole::Leader
        } else {
            RaftRole::Follower
        }
    }

    fn last_index(&self) -> u64 {
        self.state.lock().unwrap().log.len() as u64
    }
}

fn commit(state: &mut ClusterState, data: &[u8]) -> u64 {
    state.log.push(data.to_vec());
    let index = state.log.len() as u64;
    for i in 0..state.nodes.len() {
        if state.nodes[i].connected {
            deliver(state, i);
        }
    }
    index
}

fn deliver(state: &mut ClusterState, node: usize) {
    let applier = match &state.nodes[node].applier {
        Some(a) => Arc::clone(a),
        None => return,
    };
    while state.nodes[node].applied < state.log.len() {
        let at = state.nodes[node].applied;
        applier.apply_entry(at as u64 + 1, &state.log[at]);
        state.nodes[node].applied = at + 1;
    }
}
