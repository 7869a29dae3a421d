//! Persistence integration tests.
//!
//! Verifies:
//! - `save-changes` through the full server stack lands in RocksDB
//! - Records survive closing and reopening the store
//! - Per-item failure isolation and no-op deletes on the RocksDB backend
//! - Settled client changesets reproduce the client's snapshot in storage

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde_json::json;
use taskflow_collab::client::fetch_todos;
use taskflow_collab::server::{ServerConfig, SyncServer};
use taskflow_collab::storage::{
    apply_changeset, PersistOp, RocksTaskStore, StoreConfig, StoreError, TaskRepository,
};
use taskflow_core::{diff, Action, Changeset, PartialTask, Task, TaskNode, TaskTree};
use tempfile::tempdir;
use tokio_tungstenite::tungstenite::Message;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &std::path::Path) -> RocksTaskStore {
    RocksTaskStore::open(StoreConfig::for_testing(path)).unwrap()
}

fn fixture() -> Vec<Task> {
    vec![
        Task::new("1", "Todo 1"),
        Task::new("2", "Todo 2").with_parent("1"),
        Task::new("3", "Todo 3").with_parent("1").with_order(1),
        Task::new("4", "Todo 4").with_order(1),
    ]
}

fn sorted(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    tasks
}

// ─── Store-level ─────────────────────────────────────────────────────────────

#[test]
fn test_changeset_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(dir.path());
        let changes = Changeset {
            created: fixture(),
            ..Changeset::default()
        };
        let report = apply_changeset(&store, &changes);
        assert!(report.is_clean());
        assert_eq!(report.created, 4);
    }

    let store = open_store(dir.path());
    assert_eq!(sorted(store.list().unwrap()), sorted(fixture()));
}

#[test]
fn test_remove_unknown_id_is_noop_on_rocks() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    apply_changeset(
        &store,
        &Changeset {
            created: fixture(),
            ..Changeset::default()
        },
    );

    let report = apply_changeset(
        &store,
        &Changeset {
            removed: vec!["9".into()],
            ..Changeset::default()
        },
    );
    assert!(report.is_clean());
    assert_eq!(report.removed, 0);
    assert_eq!(store.count().unwrap(), 4);
}

#[test]
fn test_item_failures_are_isolated_on_rocks() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.create(&Task::new("1", "Todo 1")).unwrap();

    let report = apply_changeset(
        &store,
        &Changeset {
            created: vec![Task::new("1", "again"), Task::new("5", "Todo 5")],
            removed: vec!["1".into()],
            updated: vec![
                PartialTask::new("ghost").is_done(true),
                PartialTask::new("5").title("Todo five"),
            ],
        },
    );

    assert_eq!(report.created, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(report.updated, 1);
    let failed: Vec<_> = report.failures.iter().map(|f| (f.op, f.id.as_str())).collect();
    assert_eq!(failed, [(PersistOp::Create, "1"), (PersistOp::Update, "ghost")]);
    assert_eq!(report.failures[1].error, StoreError::NotFound("ghost".into()));

    assert!(store.get("1").unwrap().is_none());
    assert_eq!(store.get("5").unwrap().unwrap().title, "Todo five");
}

#[test]
fn test_settled_diffs_reproduce_snapshot() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let initial = TaskTree::from_tasks(fixture());
    apply_changeset(
        &store,
        &Changeset {
            created: fixture(),
            ..Changeset::default()
        },
    );

    let current = initial
        .apply(Action::Check("2".into()))
        .and_then(|t| t.apply(Action::Check("3".into())))
        .and_then(|t| t.apply(Action::Remove("4".into())))
        .and_then(|t| {
            t.apply(Action::Add(TaskNode::leaf(
                Task::new("6", "Todo 6").with_parent("1"),
            )))
        })
        .unwrap();

    let changes = diff(&initial, &current).unwrap();
    assert!(apply_changeset(&store, &changes).is_clean());

    let persisted = sorted(store.list().unwrap());
    let expected = sorted(current.into_tasks());
    assert_eq!(persisted, expected);
}

// ─── Through the server ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_save_changes_over_websocket_is_listed() {
    let dir = tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config = ServerConfig {
        bind_addr: addr.clone(),
        storage_path: Some(dir.path().join("db")),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let frame = json!({
        "meta": "save-changes",
        "room": "todo1",
        "participant": "X",
        "payload": {
            "newTodos": [
                {"id": "1", "title": "Todo 1", "isDone": false, "order": 0},
                {"id": "2", "parentId": "1", "title": "Todo 2", "isDone": true}
            ]
        }
    });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();

    let mut listed = Vec::new();
    for _ in 0..80 {
        listed = fetch_todos(&addr).await.unwrap();
        if listed.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[1].parent_id.as_deref(), Some("1"));
    assert!(listed[1].is_done);

    let mut persisted_items = 0;
    for _ in 0..80 {
        persisted_items = server.stats().await.persisted_items;
        if persisted_items == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(persisted_items, 2);
}
