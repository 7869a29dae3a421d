//! # taskflow-collab: real-time room sync for taskflow
//!
//! Keeps every participant's task tree in step through a room broker and
//! persists settled changesets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    JSON envelopes   │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ SyncSession │                     │ RoomBroker  │── fan-out by room
//! │ (TaskTree)  │                     └──────┬──────┘
//! └─────────────┘                            │ save-changes
//!                                     ┌──────┴───────┐
//!                                     │TaskRepository│
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope (`join`, `send-message`, `save-changes`, `room-joined`)
//! - [`broadcast`]: process-wide topic filtered per room and participant
//! - [`session`]: local/remote apply discipline and settle
//! - [`server`]: WebSocket server plus the `GET /todos` listing
//! - [`client`]: WebSocket client around a session
//! - [`storage`]: repository trait, in-memory and RocksDB stores

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BrokerStats, Delivery, ListenerId, RoomBroker, RoomEvent, RoomListener};
pub use client::{fetch_todos, ClientError, ConnectionState, SyncClient, SyncEvent};
pub use protocol::{new_participant_id, Envelope, Meta, ProtocolError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Inbound, Outbound, SyncSession, SyncStatus};
pub use storage::{
    apply_changeset, MemoryTaskStore, PersistOp, PersistReport, PersistenceItemFailure,
    RocksTaskStore, StoreConfig, StoreError, TaskRepository,
};
