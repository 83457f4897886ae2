//! Room fan-out.
//!
//! The broadcaster delivers one payload to every connection in a room's
//! snapshot, pruning any connection whose delivery fails. Individual
//! delivery failures are logged, never raised.

use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::ids::RoomId;
use crate::message::BroadcastPayload;
use crate::registry::Registry;

/// Fans persisted messages out to a room's live connections.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    /// Create a broadcaster over a registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver a payload to every connection currently in the room.
    ///
    /// The payload is encoded once and offered to the snapshot taken at
    /// call time, in join order. A failing target is unregistered and the
    /// broadcast proceeds. Returns the number of successful deliveries;
    /// an empty room is a valid no-op returning 0.
    pub async fn broadcast(&self, room: &RoomId, payload: &BroadcastPayload) -> usize {
        let targets = self.registry.snapshot(room);
        if targets.is_empty() {
            trace!(room = %room, "Broadcast to empty room");
            return 0;
        }

        let frame = match payload.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(room = %room, error = %e, "Failed to encode broadcast payload");
                return 0;
            }
        };

        let mut delivered = 0;
        for target in targets {
            match target.deliver(&frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        room = %room,
                        connection = %target.id(),
                        error = %e,
                        "Dropping unreachable connection"
                    );
                    self.registry.unregister(room, target.id());
                }
            }
        }

        debug!(room = %room, recipients = delivered, "Broadcast complete");
        delivered
    }
}
