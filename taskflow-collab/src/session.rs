//! Client-side sync discipline.
//!
//! A [`SyncSession`] holds two snapshots: the one the user sees and the one
//! last handed to persistence. Local edits move only the first; `settle`
//! diffs the two and advances the baseline. Remote edits go through the same
//! transition path but never produce outbound traffic.

use std::sync::Arc;

use taskflow_core::{diff, Action, TaskTree};

use crate::client::ClientError;
use crate::protocol::{Envelope, Meta};

/// User-visible synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Everything local has been handed to persistence
    Synced,
    /// Local edits are waiting for the next settle
    Pending,
    /// The real-time channel is down
    NotSynced,
}

/// What a local edit asks the transport to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Broadcast this `send-message` to the room
    Broadcast(Envelope),
    /// Applied locally only; the channel is down
    Offline,
}

/// Result of handling one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A peer's action was replayed locally
    Applied(Action),
    /// The server acknowledged our join
    Joined { room: String, participant: String },
    /// Not addressed to clients (e.g. a stray `save-changes`)
    Ignored(Meta),
}

/// Per-session sync state for one participant in one room.
#[derive(Debug, Clone)]
pub struct SyncSession {
    room: String,
    participant: String,
    current: Arc<TaskTree>,
    persisted: Arc<TaskTree>,
    save_pending: bool,
    channel_up: bool,
    joined: bool,
}

impl SyncSession {
    /// Start from a seed snapshot (typically the `GET /todos` listing).
    pub fn new(room: impl Into<String>, participant: impl Into<String>, seed: TaskTree) -> Self {
        let seed = Arc::new(seed);
        Self {
            room: room.into(),
            participant: participant.into(),
            current: Arc::clone(&seed),
            persisted: seed,
            save_pending: false,
            channel_up: true,
            joined: false,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    /// The snapshot the user sees.
    pub fn snapshot(&self) -> Arc<TaskTree> {
        Arc::clone(&self.current)
    }

    /// The snapshot last handed to persistence.
    pub fn baseline(&self) -> Arc<TaskTree> {
        Arc::clone(&self.persisted)
    }

    pub fn is_save_pending(&self) -> bool {
        self.save_pending
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn status(&self) -> SyncStatus {
        if !self.channel_up {
            SyncStatus::NotSynced
        } else if self.save_pending {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        }
    }

    /// The `join` request for this session.
    pub fn join_envelope(&self) -> Envelope {
        Envelope::join(&self.room, &self.participant)
    }

    /// Replace both snapshots, e.g. after re-fetching the persisted list.
    pub fn reseed(&mut self, seed: TaskTree) {
        let seed = Arc::new(seed);
        self.current = Arc::clone(&seed);
        self.persisted = seed;
        self.save_pending = false;
    }

    /// Apply a local edit and produce the broadcast for it.
    ///
    /// A failed transition leaves the session untouched.
    pub fn apply_local(&mut self, action: Action) -> Result<Outbound, ClientError> {
        let next = self.current.apply(action.clone())?;
        self.current = Arc::new(next);
        self.save_pending = true;

        if !self.channel_up {
            log::debug!("{} applied offline: {}", action.kind(), action.target());
            return Ok(Outbound::Offline);
        }
        let envelope = Envelope::send_message(&self.room, &self.participant, &action)?;
        Ok(Outbound::Broadcast(envelope))
    }

    /// Replay a peer's edit.
    ///
    /// The originator persists its own edits, so the action is also applied
    /// to the baseline; the next `settle` then carries only our own changes.
    pub fn apply_remote(&mut self, action: Action) -> Result<(), ClientError> {
        let next = self.current.apply(action.clone())?;
        self.current = Arc::new(next);

        match self.persisted.apply(action) {
            Ok(baseline) => self.persisted = Arc::new(baseline),
            Err(e) => log::debug!("Remote action not reflected in baseline: {e}"),
        }
        Ok(())
    }

    /// Compute the changeset since the last settle.
    ///
    /// Returns the `save-changes` envelope when there is something to save.
    /// The baseline advances whether or not the save later succeeds. While
    /// the channel is down nothing is settled, so the first settle after
    /// reconnecting carries everything edited offline.
    pub fn settle(&mut self) -> Option<Envelope> {
        if !self.channel_up {
            return None;
        }
        let changes = diff(&self.persisted, &self.current);
        self.persisted = Arc::clone(&self.current);
        self.save_pending = false;

        let changes = changes?;
        match Envelope::save_changes(&self.room, &self.participant, &changes) {
            Ok(envelope) => {
                log::debug!("Settled {} change(s) for room {}", changes.len(), self.room);
                Some(envelope)
            }
            Err(e) => {
                log::error!("Failed to encode changeset: {e}");
                None
            }
        }
    }

    /// Dispatch one frame received from the server.
    pub fn handle_inbound(&mut self, envelope: Envelope) -> Result<Inbound, ClientError> {
        match envelope.meta {
            Meta::SendMessage => {
                let action = envelope.action()?;
                self.apply_remote(action.clone())?;
                Ok(Inbound::Applied(action))
            }
            Meta::RoomJoined => {
                self.joined = true;
                Ok(Inbound::Joined {
                    room: envelope.room.unwrap_or_else(|| self.room.clone()),
                    participant: envelope
                        .participant
                        .unwrap_or_else(|| self.participant.clone()),
                })
            }
            other => Ok(Inbound::Ignored(other)),
        }
    }

    pub fn mark_channel_unavailable(&mut self) {
        if self.channel_up {
            log::warn!("Real-time channel lost; edits for room {} are not synced", self.room);
        }
        self.channel_up = false;
        self.joined = false;
    }

    pub fn mark_channel_restored(&mut self) {
        self.channel_up = true;
    }
}
