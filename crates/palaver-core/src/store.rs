//! Message persistence contract.

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::{MessageId, RoomId, UserId};
use crate::message::{InboundMessage, PersistedMessage, ReplySummary};

/// Errors reported by a message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend is unreachable or failed mid-write.
    #[error("message storage unavailable: {0}")]
    Unavailable(String),

    /// The store refused the message.
    #[error("message rejected by store: {0}")]
    Rejected(String),
}

/// Durably persists messages and resolves reply references.
///
/// Each `persist` call is a single all-or-nothing operation; the store
/// assigns the message id and the authoritative timestamp.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist an inbound message, returning the stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the caller treats this as fatal
    /// for the sending connection but not for the process.
    async fn persist(
        &self,
        message: InboundMessage,
        room: RoomId,
        sender: UserId,
    ) -> Result<PersistedMessage, StoreError>;

    /// Resolve a replied-to message into its denormalized summary, or
    /// `None` if the reference does not exist.
    async fn resolve_reply(&self, id: &MessageId) -> Option<ReplySummary>;
}
