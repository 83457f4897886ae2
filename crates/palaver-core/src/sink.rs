//! The delivery seam between the broadcaster and a connection's writer.

use async_trait::async_trait;
use thiserror::Error;

/// Delivery errors reported by a connection sink.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The peer is gone; the connection should be pruned.
    #[error("connection closed")]
    Closed,

    /// The transport faulted while sending.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Write half of a live connection, as seen by the broadcaster.
///
/// The server's implementation queues the frame onto the owning session's
/// writer channel; the actual socket send happens in that session's task, so
/// a slow peer never stalls fan-out to the rest of the room.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// Deliver one encoded frame to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is gone or the transport faulted.
    async fn deliver(&self, frame: &str) -> Result<(), DeliveryError>;
}
