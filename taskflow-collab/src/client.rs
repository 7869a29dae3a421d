//! WebSocket sync client for one participant in one room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) with a join on connect
//! - Local edits applied through [`SyncSession`] and broadcast to the room
//! - Remote edits replayed locally without re-emitting them
//! - Explicit `settle` that persists the accumulated changeset
//!
//! There is no offline queue: edits made while disconnected stay local and
//! reach storage with the first settle after reconnecting.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use taskflow_core::{Action, Task, TaskTree, TreeError};

use crate::protocol::{new_participant_id, Envelope, ProtocolError};
use crate::session::{Inbound, Outbound, SyncSession, SyncStatus};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The server acknowledged our join
    RoomJoined { room: String },
    /// A peer's action was applied to the local snapshot
    RemoteApplied(Action),
    /// A peer's message could not be applied
    RemoteRejected(String),
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The transition was rejected by the tree
    Tree(TreeError),
    Protocol(ProtocolError),
    /// The listing endpoint failed
    Http(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Tree(e) => write!(f, "Tree error: {e}"),
            ClientError::Protocol(e) => write!(f, "Protocol error: {e}"),
            ClientError::Http(e) => write!(f, "HTTP error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<TreeError> for ClientError {
    fn from(e: TreeError) -> Self {
        ClientError::Tree(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

/// Fetch the flat persisted list from `GET /todos` on `addr` (`host:port`).
pub async fn fetch_todos(addr: &str) -> Result<Vec<Task>, ClientError> {
    let http = |e: std::io::Error| ClientError::Http(e.to_string());
    let mut stream = TcpStream::connect(addr).await.map_err(http)?;
    let request = format!("GET /todos HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.map_err(http)?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.map_err(http)?;
    let text = String::from_utf8_lossy(&raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| ClientError::Http("malformed response".into()))?;
    let status = head.lines().next().unwrap_or_default();
    if !status.contains(" 200 ") {
        return Err(ClientError::Http(status.to_string()));
    }
    serde_json::from_str(body).map_err(|e| ClientError::Http(e.to_string()))
}

/// Queue an event for the application without waiting on it.
///
/// Remote edits are applied before this is called, so a full or unread
/// receiver only costs the notification.
fn notify(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::warn!("Event channel full; dropping {event:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// The sync client.
///
/// Owns a [`SyncSession`] and the WebSocket tasks that feed it.
pub struct SyncClient {
    /// Sync state shared with the reader task
    session: Arc<Mutex<SyncSession>>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL (`ws://host:port`)
    server_url: String,
}

impl SyncClient {
    /// Create a client with a fresh participant identity.
    pub fn new(server_url: impl Into<String>, room: impl Into<String>, seed: TaskTree) -> Self {
        Self::with_participant(server_url, room, new_participant_id(), seed)
    }

    pub fn with_participant(
        server_url: impl Into<String>,
        room: impl Into<String>,
        participant: impl Into<String>,
        seed: TaskTree,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let mut session = SyncSession::new(room, participant, seed);
        session.mark_channel_unavailable();
        Self {
            session: Arc::new(Mutex::new(session)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the room.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let join = {
            let mut session = self.session.lock().await;
            session.mark_channel_restored();
            session.join_envelope().encode()?
        };
        out_tx
            .send(join)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        notify(&self.event_tx, SyncEvent::Connected);

        // Reader task: replay inbound frames through the session
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match Envelope::decode(text.as_str()) {
                            Ok(envelope) => match session.lock().await.handle_inbound(envelope) {
                                Ok(Inbound::Applied(action)) => Some(SyncEvent::RemoteApplied(action)),
                                Ok(Inbound::Joined { room, .. }) => Some(SyncEvent::RoomJoined { room }),
                                Ok(Inbound::Ignored(meta)) => {
                                    log::debug!("Ignoring {} frame", meta.as_str());
                                    None
                                }
                                Err(e) => Some(SyncEvent::RemoteRejected(e.to_string())),
                            },
                            Err(e) => Some(SyncEvent::RemoteRejected(e.to_string())),
                        };
                        if let Some(evt) = event {
                            notify(&event_tx, evt);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            session.lock().await.mark_channel_unavailable();
            *state.write().await = ConnectionState::Disconnected;
            notify(&event_tx, SyncEvent::Disconnected);
        });

        log::info!("Connected to {}", self.server_url);
        Ok(())
    }

    /// Close the connection. Local state is kept.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.session.lock().await.mark_channel_unavailable();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Apply a local edit and broadcast it to the room.
    ///
    /// The edit is applied even while disconnected; in that case the call
    /// returns `ChannelUnavailable` to report that peers did not see it.
    pub async fn dispatch(&self, action: Action) -> Result<(), ClientError> {
        let outbound = self.session.lock().await.apply_local(action)?;
        match outbound {
            Outbound::Broadcast(envelope) => self.send(envelope).await,
            Outbound::Offline => Err(ProtocolError::ChannelUnavailable.into()),
        }
    }

    /// Persist everything edited since the last settle.
    ///
    /// Returns `true` if a changeset was sent.
    pub async fn settle(&self) -> Result<bool, ClientError> {
        let envelope = self.session.lock().await.settle();
        match envelope {
            Some(envelope) => {
                self.send(envelope).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace local state with a freshly fetched list.
    pub async fn reseed(&self, tasks: Vec<Task>) {
        self.session.lock().await.reseed(TaskTree::from_tasks(tasks));
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let frame = envelope.encode()?;
        let Some(tx) = &self.outgoing_tx else {
            return Err(ProtocolError::ChannelUnavailable.into());
        };
        if tx.send(frame).await.is_err() {
            self.session.lock().await.mark_channel_unavailable();
            return Err(ProtocolError::ChannelUnavailable.into());
        }
        Ok(())
    }

    /// The current local snapshot.
    pub async fn snapshot(&self) -> Arc<TaskTree> {
        self.session.lock().await.snapshot()
    }

    /// Sync status as shown to the user.
    pub async fn status(&self) -> SyncStatus {
        self.session.lock().await.status()
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn participant(&self) -> String {
        self.session.lock().await.participant().to_string()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
