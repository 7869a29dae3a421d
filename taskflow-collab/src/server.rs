//! Room sync server: one TCP port, two surfaces.
//!
//! ```text
//!                   ┌── "GET /todos" ──► JSON listing from TaskRepository
//! TcpListener ──────┤
//!                   └── anything else ─► WebSocket ──┬─ join ─────────► RoomBroker::join
//!                                                    ├─ send-message ─► RoomBroker::publish
//!                                                    └─ save-changes ─► apply_changeset
//! ```
//!
//! Each connection runs a `select!` loop over its socket and its broker
//! listener, so frames from one connection are handled strictly in order.
//! There is no ordering across connections.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{RoomBroker, RoomEvent, RoomListener};
use crate::protocol::{Envelope, Meta, ProtocolError};
use crate::storage::{
    apply_changeset, MemoryTaskStore, RocksTaskStore, StoreConfig, StoreError, TaskRepository,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Path of the listing endpoint.
const TODOS_PATH: &str = "/todos";
const TODOS_REQUEST: &[u8] = b"GET /todos";

/// How long routing waits for a split request line before giving up on it.
const ROUTE_PEEK_ATTEMPTS: u32 = 200;
const ROUTE_PEEK_INTERVAL: Duration = Duration::from_millis(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per broker listener before it starts lagging
    pub broadcast_capacity: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub http_requests: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub broadcast_events: u64,
    pub persisted_items: u64,
    pub persistence_failures: u64,
    pub active_rooms: usize,
}

/// State shared by every connection task.
struct Shared {
    broker: Arc<RoomBroker>,
    store: Arc<dyn TaskRepository>,
    stats: RwLock<ServerStats>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn TaskRepository> = match &config.storage_path {
            Some(path) => Arc::new(RocksTaskStore::open(StoreConfig::at(path.clone()))?),
            None => Arc::new(MemoryTaskStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing repository.
    pub fn with_store(config: ServerConfig, store: Arc<dyn TaskRepository>) -> Self {
        let broker = Arc::new(RoomBroker::new(config.broadcast_capacity));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shared: Arc::new(Shared {
                broker,
                store,
                stats: RwLock::new(ServerStats::default()),
            }),
            shutdown_tx,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryTaskStore::new()))
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let local = listener.local_addr()?;
        log::info!("Sync server listening on {local}");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let shared = Arc::clone(&self.shared);
                    let shutdown_rx = self.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = Self::route(stream, addr, shared, shutdown_rx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    log::info!("Sync server on {local} shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop accepting, close the broker and end every open connection.
    pub fn shutdown(&self) {
        self.shared.broker.shutdown();
        self.shutdown_tx.send_replace(true);
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.broker.room_count();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn broker(&self) -> &Arc<RoomBroker> {
        &self.shared.broker
    }

    pub fn store(&self) -> &Arc<dyn TaskRepository> {
        &self.shared.store
    }

    /// Dispatch a fresh TCP stream to the HTTP listing or the WebSocket loop.
    async fn route(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let mut head = [0u8; 64];
        let mut attempts = 0;
        let n = loop {
            let n = stream.peek(&mut head).await?;
            if n == 0 {
                return Ok(());
            }
            if !is_partial_todos_request(&head[..n]) || attempts >= ROUTE_PEEK_ATTEMPTS {
                break n;
            }
            // Peek does not wait for more bytes once some are buffered.
            attempts += 1;
            tokio::time::sleep(ROUTE_PEEK_INTERVAL).await;
        };
        if is_todos_request(&head[..n]) {
            return Self::serve_todos(stream, addr, &shared).await;
        }
        Self::handle_connection(stream, addr, shared, shutdown_rx).await
    }

    /// Answer `GET /todos` with the flat persisted list.
    async fn serve_todos(
        stream: TcpStream,
        addr: SocketAddr,
        shared: &Shared,
    ) -> Result<(), BoxError> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 || line.trim_end().is_empty() {
                break;
            }
        }
        shared.stats.write().await.http_requests += 1;

        let (status, body) = match shared.store.list() {
            Ok(tasks) => ("200 OK", serde_json::to_string(&tasks)?),
            Err(e) => {
                log::error!("Failed to list tasks for {addr}: {e}");
                (
                    "500 Internal Server Error",
                    serde_json::json!({ "error": e.to_string() }).to_string(),
                )
            }
        };
        let response = format!(
            "HTTP/1.1 {status}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );

        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        log::debug!("Served {TODOS_PATH} to {addr}");
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut listener: Option<RoomListener> = None;
        let result = Self::connection_loop(ws_stream, addr, &shared, &mut listener, shutdown_rx).await;

        // Deregister before the connection counts as closed.
        if let Some(listener) = listener.take() {
            log::info!(
                "Participant {} left room {}",
                listener.participant(),
                listener.room()
            );
            listener.close();
        }
        shared.stats.write().await.active_connections -= 1;
        result
    }

    async fn connection_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        shared: &Shared,
        listener: &mut Option<RoomListener>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let envelope = match Envelope::decode(text.as_str()) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            match Self::handle_envelope(envelope, shared, listener).await {
                                Ok(Some(reply)) => {
                                    ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                }
                                Ok(None) => {}
                                Err(e) => log::warn!("Rejected message from {addr}: {e}"),
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Ignoring binary frame from {addr}");
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Event fanned out by the broker
                event = async {
                    match listener.as_mut() {
                        Some(l) => l.recv().await,
                        // Not joined yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Some(event) => {
                            let frame = event.to_envelope().encode()?;
                            ws_sender.send(Message::Text(frame.into())).await?;
                        }
                        None => {
                            log::debug!("Broker closed; ending connection from {addr}");
                            break;
                        }
                    }
                }

                _ = shutdown_rx.changed() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Process one decoded envelope; returns the direct reply, if any.
    async fn handle_envelope(
        envelope: Envelope,
        shared: &Shared,
        listener: &mut Option<RoomListener>,
    ) -> Result<Option<Envelope>, ProtocolError> {
        match envelope.meta {
            Meta::Join => {
                let room = envelope.require_room()?;
                let participant = envelope.require_participant()?;
                // Replacing the listener drops (and deregisters) any previous one.
                *listener = Some(shared.broker.join(room, participant));
                log::info!("Participant {participant} joined room {room}");
                Ok(Some(Envelope::room_joined(room, participant)))
            }

            Meta::SendMessage => {
                let room = envelope.require_room()?;
                let participant = envelope.require_participant()?;
                if let Ok(action) = envelope.action() {
                    log::debug!(
                        "{participant} in {room}: {} {}",
                        action.kind(),
                        action.target()
                    );
                }
                let event = RoomEvent::new(
                    Meta::SendMessage,
                    room,
                    participant,
                    envelope.payload.clone(),
                );
                let receivers = shared.broker.publish(event);
                log::debug!("Fanned out to {receivers} listener(s)");
                shared.stats.write().await.broadcast_events += 1;
                Ok(None)
            }

            Meta::SaveChanges => {
                let changes = envelope.changeset()?;
                let store = Arc::clone(&shared.store);
                let report =
                    tokio::task::spawn_blocking(move || apply_changeset(store.as_ref(), &changes))
                        .await
                        .map_err(|_| ProtocolError::ChannelUnavailable)?;

                let mut s = shared.stats.write().await;
                s.persisted_items += (report.created + report.updated + report.removed) as u64;
                s.persistence_failures += report.failures.len() as u64;
                Ok(None)
            }

            Meta::RoomJoined => Err(ProtocolError::InvalidMessageType),
        }
    }
}

/// True when the request line is `GET /todos` (optionally with a query).
fn is_todos_request(head: &[u8]) -> bool {
    let Some(after) = head.strip_prefix(TODOS_REQUEST) else {
        return false;
    };
    matches!(after.first(), Some(b' ') | Some(b'?') | Some(b'/'))
}

/// The bytes so far could still become `GET /todos `.
fn is_partial_todos_request(head: &[u8]) -> bool {
    head.len() <= TODOS_REQUEST.len() && TODOS_REQUEST.starts_with(head)
}
