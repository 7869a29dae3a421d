//! Room broker: one process-wide topic, filtered per listener at delivery.
//!
//! ```text
//!  publish(RoomEvent) ──► broadcast::Sender ──┬──► RoomListener (room r, X) ✗ own event
//!                                             ├──► RoomListener (room r, Y) ✓
//!                                             └──► RoomListener (room s, Z) ✗ other room
//! ```
//!
//! Every listener receives every event from the tokio broadcast channel and
//! keeps only those for its room that did not originate from its own
//! participant (unless the event is addressed to everyone). The registry
//! tracks which listeners are alive; a listener deregisters itself when it
//! is closed or dropped, so a dead connection never keeps matching rooms.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::{Envelope, Meta};

/// Registry key of one joined connection.
pub type ListenerId = u64;

/// Who in the room receives an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Every participant except the originator
    #[default]
    Others,
    /// Every participant, originator included
    Everyone,
}

/// One event on the shared topic.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    pub meta: Meta,
    pub room: String,
    pub participant: String,
    pub delivery: Delivery,
    pub payload: Option<Value>,
}

impl RoomEvent {
    pub fn new(
        meta: Meta,
        room: impl Into<String>,
        participant: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            meta,
            room: room.into(),
            participant: participant.into(),
            delivery: Delivery::Others,
            payload,
        }
    }

    /// Address the event to the whole room, originator included.
    pub fn to_everyone(mut self) -> Self {
        self.delivery = Delivery::Everyone;
        self
    }

    /// The frame a receiving connection writes to its socket.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::fan_out(self.meta, self.payload.clone())
    }
}

/// Statistics for monitoring broker health.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_lagged: u64,
    pub active_listeners: usize,
    pub active_rooms: usize,
}

/// Lock-free counters shared with every listener.
#[derive(Default)]
struct AtomicBrokerStats {
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    events_lagged: AtomicU64,
}

#[derive(Debug, Clone)]
struct ListenerEntry {
    room: String,
    participant: String,
}

/// Live listeners, keyed by id.
#[derive(Default)]
struct Registry {
    entries: RwLock<HashMap<ListenerId, ListenerEntry>>,
}

impl Registry {
    fn insert(&self, id: ListenerId, entry: ListenerEntry) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entry);
    }

    fn remove(&self, id: ListenerId) -> Option<ListenerEntry> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    fn contains(&self, id: ListenerId) -> bool {
        self.read(|entries| entries.contains_key(&id))
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<ListenerId, ListenerEntry>) -> T) -> T {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        f(&*entries)
    }

    fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let count = entries.len();
        entries.clear();
        count
    }
}

/// The process-wide publish/subscribe bus.
///
/// Created at server start; [`RoomBroker::shutdown`] drops the topic so
/// every pending [`RoomListener::recv`] returns `None`.
pub struct RoomBroker {
    sender: RwLock<Option<broadcast::Sender<Arc<RoomEvent>>>>,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    capacity: usize,
    stats: Arc<AtomicBrokerStats>,
}

impl RoomBroker {
    /// Create a broker whose topic buffers `capacity` events per listener.
    ///
    /// A listener that falls further behind skips the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
            registry: Arc::new(Registry::default()),
            next_id: AtomicU64::new(1),
            capacity,
            stats: Arc::new(AtomicBrokerStats::default()),
        }
    }

    /// Register a listener for `room` on behalf of `participant`.
    pub fn join(&self, room: impl Into<String>, participant: impl Into<String>) -> RoomListener {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let room = room.into();
        let participant = participant.into();
        let rx = self
            .sender
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.subscribe());

        if rx.is_some() {
            self.registry.insert(
                id,
                ListenerEntry {
                    room: room.clone(),
                    participant: participant.clone(),
                },
            );
            log::debug!("Listener {id} joined room {room} as {participant}");
        } else {
            log::warn!("Join for room {room} after broker shutdown");
        }

        RoomListener {
            id,
            room,
            participant,
            rx,
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Deregister a listener. Returns `false` if it was already gone.
    ///
    /// The listener's next [`RoomListener::recv`] returns `None`.
    pub fn leave(&self, id: ListenerId) -> bool {
        self.registry.remove(id).is_some()
    }

    /// Publish an event to the topic.
    ///
    /// Returns the number of subscribed receivers (before room filtering).
    pub fn publish(&self, event: RoomEvent) -> usize {
        let guard = self.sender.read().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_ref() else {
            return 0;
        };
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        sender.send(Arc::new(event)).unwrap_or(0)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.registry.read(|entries| entries.len())
    }

    /// Participants currently joined to `room`, sorted.
    pub fn room_members(&self, room: &str) -> Vec<String> {
        self.registry.read(|entries| {
            entries
                .values()
                .filter(|e| e.room == room)
                .map(|e| e.participant.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        })
    }

    /// Number of distinct rooms with at least one listener.
    pub fn room_count(&self) -> usize {
        self.registry.read(|entries| {
            entries
                .values()
                .map(|e| e.room.as_str())
                .collect::<BTreeSet<_>>()
                .len()
        })
    }

    /// Broker statistics snapshot.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_delivered: self.stats.events_delivered.load(Ordering::Relaxed),
            events_lagged: self.stats.events_lagged.load(Ordering::Relaxed),
            active_listeners: self.listener_count(),
            active_rooms: self.room_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the topic and forget every listener.
    pub fn shutdown(&self) {
        let sender = self.sender.write().unwrap_or_else(|e| e.into_inner()).take();
        let dropped = self.registry.clear();
        if sender.is_some() {
            log::info!("Room broker shut down ({dropped} listeners released)");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.read().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// A joined connection's view of the topic.
pub struct RoomListener {
    id: ListenerId,
    room: String,
    participant: String,
    rx: Option<broadcast::Receiver<Arc<RoomEvent>>>,
    registry: Arc<Registry>,
    stats: Arc<AtomicBrokerStats>,
}

impl RoomListener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    /// Delivery filter: same room, and not our own event unless addressed
    /// to everyone.
    pub fn accepts(&self, event: &RoomEvent) -> bool {
        event.room == self.room
            && (event.delivery == Delivery::Everyone || event.participant != self.participant)
    }

    /// Wait for the next event addressed to this listener.
    ///
    /// Returns `None` once the broker shuts down or the listener has been
    /// deregistered. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Arc<RoomEvent>> {
        loop {
            if !self.registry.contains(self.id) {
                self.rx = None;
            }
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(_) if !self.registry.contains(self.id) => {
                    self.rx = None;
                    return None;
                }
                Ok(event) if self.accepts(&event) => {
                    self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.events_lagged.fetch_add(n, Ordering::Relaxed);
                    log::warn!(
                        "Listener {} ({}) lagged by {n} events",
                        self.id,
                        self.participant
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Deregister from the broker and stop receiving.
    pub fn close(self) {}
}

impl Drop for RoomListener {
    fn drop(&mut self) {
        if self.registry.remove(self.id).is_some() {
            log::debug!("Listener {} left room {}", self.id, self.room);
        }
    }
}
