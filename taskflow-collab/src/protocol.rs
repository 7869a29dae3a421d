//! JSON envelope protocol for room-based task sync.
//!
//! Every WebSocket text frame carries one [`Envelope`]:
//! ```text
//! { "meta": "join" | "send-message" | "save-changes" | "room-joined",
//!   "room": "...",          // omitted on fanned-out frames
//!   "participant": "...",   // omitted on fanned-out frames
//!   "payload": { ... } }    // Action or Changeset, depending on meta
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskflow_core::{Action, Changeset};
use uuid::Uuid;

/// Message purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Meta {
    /// Participant asks to join a room
    Join,
    /// Reducer action to fan out to the rest of the room
    SendMessage,
    /// Changeset to persist; never re-broadcast
    SaveChanges,
    /// Server acknowledgment of `join`
    RoomJoined,
}

impl Meta {
    pub fn as_str(&self) -> &'static str {
        match self {
            Meta::Join => "join",
            Meta::SendMessage => "send-message",
            Meta::SaveChanges => "save-changes",
            Meta::RoomJoined => "room-joined",
        }
    }
}

/// Generate the opaque identity used for one client session.
pub fn new_participant_id() -> String {
    format!("participant-{}", Uuid::new_v4())
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Create a join request.
    pub fn join(room: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            meta: Meta::Join,
            room: Some(room.into()),
            participant: Some(participant.into()),
            payload: None,
        }
    }

    /// Create a join acknowledgment.
    pub fn room_joined(room: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            meta: Meta::RoomJoined,
            ..Self::join(room, participant)
        }
    }

    /// Wrap a local reducer action for broadcast.
    pub fn send_message(
        room: impl Into<String>,
        participant: impl Into<String>,
        action: &Action,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(action)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            meta: Meta::SendMessage,
            room: Some(room.into()),
            participant: Some(participant.into()),
            payload: Some(payload),
        })
    }

    /// Wrap a changeset for persistence.
    pub fn save_changes(
        room: impl Into<String>,
        participant: impl Into<String>,
        changes: &Changeset,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(changes)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            meta: Meta::SaveChanges,
            room: Some(room.into()),
            participant: Some(participant.into()),
            payload: Some(payload),
        })
    }

    /// The stripped `{meta, payload}` form delivered to other participants.
    pub fn fan_out(meta: Meta, payload: Option<Value>) -> Self {
        Self {
            meta,
            room: None,
            participant: None,
            payload,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// The room, required on every inbound message except acknowledgments.
    pub fn require_room(&self) -> Result<&str, ProtocolError> {
        self.room
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidPayload("missing room".into()))
    }

    /// The sender identity.
    pub fn require_participant(&self) -> Result<&str, ProtocolError> {
        self.participant
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidPayload("missing participant".into()))
    }

    /// Parse a `send-message` payload as a reducer action.
    pub fn action(&self) -> Result<Action, ProtocolError> {
        if self.meta != Meta::SendMessage {
            return Err(ProtocolError::InvalidMessageType);
        }
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| ProtocolError::InvalidPayload("missing action".into()))?;
        serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Parse a `save-changes` payload as a changeset.
    pub fn changeset(&self) -> Result<Changeset, ProtocolError> {
        if self.meta != Meta::SaveChanges {
            return Err(ProtocolError::InvalidMessageType);
        }
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| ProtocolError::InvalidPayload("missing changeset".into()))?;
        serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    InvalidPayload(String),
    /// Real-time channel is down; local edits apply but are not synced.
    ChannelUnavailable,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::ChannelUnavailable => write!(f, "Real-time channel unavailable"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
