//! State-machine behavior when applying committed log entries.

use std::sync::Arc;

use tempfile::TempDir;

use replidb::command::{encode, Command};
use replidb::connection::ConnRegistry;
use replidb::engine::{Engine, FrameBatch, WalPage};
use replidb::replication::{Fsm, FsmError, HookSync};
use replidb::transaction::{TxnRegistry, TxnState};

struct Node {
    _dir: TempDir,
    connections: Arc<ConnRegistry>,
    transactions: Arc<TxnRegistry>,
    fsm: Fsm,
}

fn node() -> Node {
    let dir = TempDir::new().unwrap();
    let connections = Arc::new(ConnRegistry::new(dir.path(), Arc::new(Engine::new())));
    let transactions = Arc::new(TxnRegistry::new());
    let fsm = Fsm::new(
        Arc::clone(&connections),
        Arc::clone(&transactions),
        Arc::new(HookSync::new()),
    );
    Node {
        _dir: dir,
        connections,
        transactions,
        fsm,
    }
}

fn batch(pages: &[(u32, u8)], is_commit: bool, truncate: u32) -> FrameBatch {
    FrameBatch {
        page_size: 512,
        pages: pages
            .iter()
            .map(|&(number, fill)| WalPage {
                number,
                flags: 0,
                data: vec![fill; 512],
            })
            .collect(),
        truncate,
        is_commit,
        sync_flags: 0,
    }
}

fn apply(node: &Node, index: u64, command: Command) {
    node.fsm.apply(index, &encode(&command, 0)).unwrap();
}

#[test]
fn test_open_is_idempotent() {
    let node = node();
    apply(
        &node,
        1,
        Command::Open {
            name: "app.db".into(),
        },
    );
    assert!(node.connections.has_follower("app.db"));

    // Replays must not panic on the second registration.
    apply(
        &node,
        2,
        Command::Open {
            name: "app.db".into(),
        },
    );
    assert_eq!(node.fsm.last_applied(), 2);
}

#[test]
fn test_write_transaction_lifecycle() {
    let node = node();
    apply(
        &node,
        1,
        Command::Open {
            name: "app.db".into(),
        },
    );
    apply(
        &node,
        2,
        Command::Begin {
            txn_id: 1,
            name: "app.db".into(),
        },
    );

    let txn = node.transactions.get_by_id(1).unwrap();
    assert!(!txn.is_leader());
    assert_eq!(txn.state(), TxnState::Pending);

    apply(
        &node,
        3,
        Command::Frames {
            txn_id: 1,
            name: "app.db".into(),
            frames: batch(&[(1, 0xAA)], false, 0),
        },
    );
    assert_eq!(txn.state(), TxnState::Writing);

    apply(
        &node,
        4,
        Command::Frames {
            txn_id: 1,
            name: "app.db".into(),
            frames: batch(&[(2, 0xBB)], true, 2),
        },
    );
    assert_eq!(txn.state(), TxnState::Written);

    apply(&node, 5, Command::End { txn_id: 1 });
    assert!(node.transactions.get_by_id(1).is_none());
    assert_eq!(node.fsm.last_applied(), 5);

    let (_, wal) = node.connections.backup("app.db").unwrap();
    assert!(!wal.is_empty());
}

#[test]
fn test_undo_rolls_the_wal_back() {
    let node = node();
    apply(
        &node,
        1,
        Command::Open {
            name: "app.db".into(),
        },
    );
    apply(
        &node,
        2,
        Command::Begin {
            txn_id: 1,
            name: "app.db".into(),
        },
    );
    apply(
        &node,
        3,
        Command::Frames {
            txn_id: 1,
            name: "app.db".into(),
            frames: batch(&[(1, 0xAA)], false, 0),
        },
    );
    apply(&node, 4, Command::Undo { txn_id: 1 });
    let txn = node.transactions.get_by_id(1).unwrap();
    assert_eq!(txn.state(), TxnState::Undone);
    apply(&node, 5, Command::End { txn_id: 1 });

    let (_, wal) = node.connections.backup("app.db").unwrap();
    // Header only: the frame was rolled back.
    assert_eq!(wal.len(), replidb::wal::WAL_HEADER_SIZE);
}

#[test]
fn test_unknown_transaction_is_fatal() {
    let node = node();
    node.fsm.set_panic_on_failure(false);
    let err = node
        .fsm
        .apply(1, &encode(&Command::Undo { txn_id: 99 }, 0))
        .unwrap_err();
    assert!(matches!(err, FsmError::NoSuchTransaction(99)));
    assert_eq!(node.fsm.last_applied(), 0);
}

#[test]
fn test_corrupt_entry_is_fatal() {
    let node = node();
    node.fsm.set_panic_on_failure(false);
    let err = node.fsm.apply(1, b"not a command").unwrap_err();
    assert!(matches!(err, FsmError::Corrupt(_)));
}

#[test]
#[should_panic(expected = "apply of log entry 1 failed")]
fn test_failures_panic_by_default() {
    let node = node();
    node.fsm
        .apply(1, &encode(&Command::Undo { txn_id: 99 }, 0))
        .ok();
}

#[test]
fn test_checkpoint_blocked_while_transaction_open() {
    let node = node();
    node.fsm.set_panic_on_failure(false);
    apply(
        &node,
        1,
        Command::Open {
            name: "app.db".into(),
        },
    );
    apply(
        &node,
        2,
        Command::Begin {
            txn_id: 1,
            name: "app.db".into(),
        },
    );

    let err = node
        .fsm
        .apply(
            3,
            &encode(
                &Command::Checkpoint {
                    name: "app.db".into(),
                },
                0,
            ),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        FsmError::CheckpointBlocked { txn_id: 1, .. }
    ));
}

#[test]
fn test_checkpoint_blocked_by_sibling_leader_transaction() {
    let node = node();
    node.fsm.set_panic_on_failure(false);
    apply(
        &node,
        1,
        Command::Open {
            name: "app.db".into(),
        },
    );

    // The transaction sits on the second of two leader connections;
    // the exclusion check must still find it.
    let first = node.connections.open_leader("app.db").unwrap();
    let second = node.connections.open_leader("app.db").unwrap();
    let txn = node
        .transactions
        .add_leader(&second, 9, &[Arc::clone(&first)])
        .unwrap();
    txn.begin().unwrap();

    let err = node
        .fsm
        .apply(
            2,
            &encode(
                &Command::Checkpoint {
                    name: "app.db".into(),
                },
                0,
            ),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        FsmError::CheckpointBlocked { txn_id: 9, .. }
    ));
}

#[test]
fn test_checkpoint_folds_wal_into_database() {
    let node = node();
    apply(
        &node,
        1,
        Command::Open {
            name: "app.db".into(),
        },
    );
    apply(
        &node,
        2,
        Command::Begin {
            txn_id: 1,
            name: "app.db".into(),
        },
    );
    apply(
        &node,
        3,
        Command::Frames {
            txn_id: 1,
            name: "app.db".into(),
            frames: batch(&[(1, 0xAA), (2, 0xBB)], true, 2),
        },
    );
    apply(&node, 4, Command::End { txn_id: 1 });
    apply(
        &node,
        5,
        Command::Checkpoint {
            name: "app.db".into(),
        },
    );

    let (db, wal) = node.connections.backup("app.db").unwrap();
    assert_eq!(db.len(), 2 * 512);
    assert_eq!(&db[..512], &[0xAA; 512][..]);
    assert_eq!(&db[512..], &[0xBB; 512][..]);
    assert_eq!(wal.len(), replidb::wal::WAL_HEADER_SIZE);
}
