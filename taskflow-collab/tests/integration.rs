//! Integration tests for end-to-end room sync.
//!
//! These tests start a real server and connect real clients (and raw
//! WebSocket peers), verifying the full pipeline.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use taskflow_collab::client::{fetch_todos, ConnectionState, SyncClient, SyncEvent};
use taskflow_collab::protocol::{Envelope, Meta};
use taskflow_collab::server::{ServerConfig, SyncServer};
use taskflow_collab::session::SyncStatus;
use taskflow_collab::storage::{MemoryTaskStore, TaskRepository};
use taskflow_core::{Action, Task, TaskNode, TaskTree};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port over `store`; returns it and its address.
async fn start_test_server(store: Arc<MemoryTaskStore>) -> (Arc<SyncServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config = ServerConfig {
        bind_addr: addr.clone(),
        broadcast_capacity: 64,
        storage_path: None,
    };
    let server = Arc::new(SyncServer::with_store(config, store));
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, addr)
}

async fn raw_connect(addr: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, envelope: Value) {
    ws.send(Message::Text(envelope.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, or `None` if nothing arrives in time.
async fn next_json(ws: &mut Ws, wait: Duration) -> Option<Value> {
    loop {
        match timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str(text.as_str()).unwrap())
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

async fn raw_join(addr: &str, room: &str, participant: &str) -> Ws {
    let mut ws = raw_connect(addr).await;
    send(&mut ws, json!({"meta": "join", "room": room, "participant": participant})).await;
    let ack = next_json(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(
        ack,
        json!({"meta": "room-joined", "room": room, "participant": participant})
    );
    ws
}

async fn wait_for_event(
    rx: &mut mpsc::Receiver<SyncEvent>,
    matches: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event within timeout")
}

/// Poll `check` until it holds or the deadline passes.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..80 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, addr) = start_test_server(Arc::new(MemoryTaskStore::new())).await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_send_message_reaches_only_other_participants() {
    let (_server, addr) = start_test_server(Arc::new(MemoryTaskStore::new())).await;
    let mut x = raw_join(&addr, "r", "X").await;
    let mut y = raw_join(&addr, "r", "Y").await;

    send(
        &mut x,
        json!({
            "meta": "send-message",
            "room": "r",
            "participant": "X",
            "payload": {"type": "CHECK", "value": "5"}
        }),
    )
    .await;

    let received = next_json(&mut y, Duration::from_secs(2)).await.unwrap();
    assert_eq!(
        received,
        json!({"meta": "send-message", "payload": {"type": "CHECK", "value": "5"}})
    );
    assert!(next_json(&mut y, Duration::from_millis(200)).await.is_none(), "exactly one");
    assert!(next_json(&mut x, Duration::from_millis(200)).await.is_none(), "no echo");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_server, addr) = start_test_server(Arc::new(MemoryTaskStore::new())).await;
    let mut a = raw_join(&addr, "room-a", "A").await;
    let mut b = raw_join(&addr, "room-b", "B").await;
    let mut c = raw_join(&addr, "room-b", "C").await;

    send(
        &mut c,
        json!({
            "meta": "send-message",
            "room": "room-b",
            "participant": "C",
            "payload": {"type": "REMOVE", "value": "1"}
        }),
    )
    .await;

    assert!(next_json(&mut b, Duration::from_secs(2)).await.is_some());
    assert!(next_json(&mut a, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_disconnect_deregisters_listener() {
    let (server, addr) = start_test_server(Arc::new(MemoryTaskStore::new())).await;
    let mut x = raw_join(&addr, "r", "X").await;
    let _y = raw_join(&addr, "r", "Y").await;
    assert_eq!(server.broker().listener_count(), 2);

    x.close(None).await.unwrap();
    let broker = Arc::clone(server.broker());
    assert!(eventually(|| broker.listener_count() == 1).await);
    assert_eq!(broker.room_members("r"), vec!["Y".to_string()]);
}

#[tokio::test]
async fn test_undecodable_frame_keeps_connection_open() {
    let (_server, addr) = start_test_server(Arc::new(MemoryTaskStore::new())).await;
    let mut ws = raw_connect(&addr).await;
    ws.send(Message::Text("not json".into())).await.unwrap();
    send(&mut ws, json!({"meta": "join", "room": "r", "participant": "X"})).await;

    let ack = next_json(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack["meta"], "room-joined");
}

#[tokio::test]
async fn test_save_changes_removing_unknown_id_is_noop() {
    let store = Arc::new(MemoryTaskStore::with_tasks(vec![Task::new("1", "Todo 1")]));
    let (_server, addr) = start_test_server(store.clone()).await;
    let mut ws = raw_join(&addr, "todo1", "X").await;

    send(
        &mut ws,
        json!({
            "meta": "save-changes",
            "room": "todo1",
            "participant": "X",
            "payload": {"newTodos": [], "removeTodos": ["9"], "updateTodos": []}
        }),
    )
    .await;
    assert!(next_json(&mut ws, Duration::from_millis(200)).await.is_none(), "no reply");

    // Connection still serves requests after the no-op.
    send(&mut ws, json!({"meta": "join", "room": "todo1", "participant": "X"})).await;
    assert!(next_json(&mut ws, Duration::from_secs(2)).await.is_some());
    assert_eq!(store.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_get_todos_lists_persisted_records() {
    let store = Arc::new(MemoryTaskStore::with_tasks(vec![
        Task::new("1", "Todo 1"),
        Task::new("2", "Todo 2").with_parent("1").done(true),
    ]));
    let (server, addr) = start_test_server(store).await;

    let tasks = fetch_todos(&addr).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].parent_id.as_deref(), Some("1"));
    assert!(tasks[1].is_done);
    assert_eq!(server.stats().await.http_requests, 1);
}

#[tokio::test]
async fn test_get_todos_split_across_segments() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let store = Arc::new(MemoryTaskStore::with_tasks(vec![Task::new("1", "Todo 1")]));
    let (_server, addr) = start_test_server(store).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    stream.write_all(b"GET /to").await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream
        .write_all(b"dos HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    timeout(Duration::from_secs(2), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "got {text}");
    let (_, body) = text.split_once("\r\n\r\n").unwrap();
    let tasks: Vec<Task> = serde_json::from_str(body).unwrap();
    assert_eq!(tasks, vec![Task::new("1", "Todo 1")]);
}

#[tokio::test]
async fn test_two_clients_sync_and_persist() {
    let store = Arc::new(MemoryTaskStore::with_tasks(vec![Task::new("1", "Todo 1")]));
    let (_server, addr) = start_test_server(store.clone()).await;
    let url = format!("ws://{addr}");

    let seed = TaskTree::from_tasks(fetch_todos(&addr).await.unwrap());
    let mut alice = SyncClient::new(&url, "todo1", seed.clone());
    let mut bob = SyncClient::new(&url, "todo1", seed);
    let mut alice_rx = alice.take_event_rx().unwrap();
    let mut bob_rx = bob.take_event_rx().unwrap();

    alice.connect().await.unwrap();
    wait_for_event(&mut alice_rx, |e| matches!(e, SyncEvent::RoomJoined { .. })).await;
    bob.connect().await.unwrap();
    wait_for_event(&mut bob_rx, |e| matches!(e, SyncEvent::RoomJoined { .. })).await;
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);

    let add = Action::Add(TaskNode::leaf(Task::new("2", "Todo 2")));
    alice.dispatch(add.clone()).await.unwrap();
    assert_eq!(alice.status().await, SyncStatus::Pending);

    let event = wait_for_event(&mut bob_rx, |e| matches!(e, SyncEvent::RemoteApplied(_))).await;
    assert_eq!(event, SyncEvent::RemoteApplied(add));
    let bob_view = bob.snapshot().await;
    assert_eq!(bob_view.get("2").unwrap().order, 0);
    assert_eq!(bob_view.get("1").unwrap().order, 1);

    // The originator persists; the peer has nothing of its own to save.
    assert!(alice.settle().await.unwrap());
    assert!(!bob.settle().await.unwrap());
    assert_eq!(alice.status().await, SyncStatus::Synced);

    let persisted = Arc::clone(&store);
    assert!(
        eventually(|| {
            persisted.get("2").ok().flatten().is_some()
                && persisted.get("1").ok().flatten().map(|t| t.order) == Some(1)
        })
        .await
    );

    bob.dispatch(Action::Check("2".into())).await.unwrap();
    wait_for_event(&mut alice_rx, |e| matches!(e, SyncEvent::RemoteApplied(_))).await;
    assert!(alice.snapshot().await.get("2").unwrap().is_done);
}

#[tokio::test]
async fn test_remote_edits_apply_without_event_reader() {
    let (server, addr) = start_test_server(Arc::new(MemoryTaskStore::new())).await;
    let url = format!("ws://{addr}");

    // Nobody ever takes this client's event receiver.
    let mut quiet = SyncClient::new(&url, "todo1", TaskTree::new());
    quiet.connect().await.unwrap();
    let mut busy = SyncClient::new(&url, "todo1", TaskTree::new());
    let mut busy_rx = busy.take_event_rx().unwrap();
    busy.connect().await.unwrap();
    wait_for_event(&mut busy_rx, |e| matches!(e, SyncEvent::RoomJoined { .. })).await;
    let broker = Arc::clone(server.broker());
    assert!(eventually(|| broker.listener_count() == 2).await);

    for i in 0..400 {
        let task = Task::new(format!("n{i:03}"), "remote");
        busy.dispatch(Action::Add(TaskNode::leaf(task))).await.unwrap();
    }

    let mut applied = 0;
    for _ in 0..200 {
        applied = quiet.snapshot().await.len();
        if applied == 400 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(applied, 400);
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let (server, addr) = start_test_server(Arc::new(MemoryTaskStore::new())).await;
    let mut client = SyncClient::new(format!("ws://{addr}"), "todo1", TaskTree::new());
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for_event(&mut rx, |e| matches!(e, SyncEvent::RoomJoined { .. })).await;

    server.shutdown();
    wait_for_event(&mut rx, |e| *e == SyncEvent::Disconnected).await;
    assert_eq!(client.status().await, SyncStatus::NotSynced);
    let broker = Arc::clone(server.broker());
    assert!(eventually(|| broker.listener_count() == 0).await);
}

#[test]
fn test_envelope_meta_names() {
    for meta in [Meta::Join, Meta::SendMessage, Meta::SaveChanges, Meta::RoomJoined] {
        let env = Envelope::fan_out(meta, None);
        let json: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["meta"], meta.as_str());
    }
}
