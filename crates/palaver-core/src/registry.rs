//! The connection registry: live connections grouped by room.
//!
//! The registry is the only state shared across connection tasks. All
//! operations are safe to call concurrently from independent session
//! lifecycles and from the broadcaster; mutual exclusion is per room shard.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ids::{ConnectionId, RoomId};
use crate::sink::{ConnectionSink, DeliveryError};

/// A registered room member: connection id plus its delivery sink.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sink: Arc<dyn ConnectionSink>,
}

impl ConnectionHandle {
    /// Create a new handle.
    #[must_use]
    pub fn new(id: ConnectionId, sink: Arc<dyn ConnectionSink>) -> Self {
        Self { id, sink }
    }

    /// The connection's id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Deliver one encoded frame to this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is gone or the transport faulted.
    pub async fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
        self.sink.deliver(frame).await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of rooms with at least one live connection.
    pub rooms: usize,
    /// Total live connections across all rooms.
    pub connections: usize,
}

/// Live connections grouped by room, in join order.
///
/// Invariants: a room key exists iff at least one connection is registered
/// under it, and a connection appears in at most one room, at most once.
#[derive(Debug, Default)]
pub struct Registry {
    rooms: DashMap<RoomId, Vec<ConnectionHandle>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under a room, creating the room entry if absent.
    ///
    /// Registering the same connection id twice is a caller bug; the
    /// duplicate is ignored to preserve the at-most-once invariant.
    pub fn register(&self, room: RoomId, handle: ConnectionHandle) {
        let mut members = self.rooms.entry(room).or_default();
        if members.iter().any(|m| m.id() == handle.id()) {
            warn!(room = %room, connection = %handle.id(), "Duplicate registration ignored");
            return;
        }
        members.push(handle);
        debug!(room = %room, connections = members.len(), "Connection registered");
    }

    /// Remove a connection from a room.
    ///
    /// Removing an absent connection is a safe no-op: teardown paths race
    /// with broadcast-triggered pruning. The room entry is dropped when it
    /// empties. Returns whether a connection was actually removed.
    pub fn unregister(&self, room: &RoomId, connection: ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut members) => {
                let before = members.len();
                members.retain(|m| m.id() != connection);
                before != members.len()
            }
            None => false,
        };

        if removed {
            debug!(room = %room, connection = %connection, "Connection unregistered");
            // Shard guard is released above; evict the entry if it emptied.
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }

        removed
    }

    /// Point-in-time copy of a room's connections, for safe iteration while
    /// registration continues. Empty if the room has no entry.
    #[must_use]
    pub fn snapshot(&self, room: &RoomId) -> Vec<ConnectionHandle> {
        self.rooms
            .get(room)
            .map(|members| members.value().clone())
            .unwrap_or_default()
    }

    /// Whether the room currently has any live connection.
    #[must_use]
    pub fn contains(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// Number of live connections in a room.
    #[must_use]
    pub fn connection_count(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    /// Number of rooms with at least one live connection.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            rooms: self.rooms.len(),
            connections: self.rooms.iter().map(|entry| entry.len()).sum(),
        }
    }
}
