//! Message types flowing through the relay.
//!
//! An [`InboundMessage`] is the validated form of a client frame. The
//! message store turns it into a [`PersistedMessage`], which is projected
//! into a wire frame (with an optional [`ReplySummary`]) for fan-out.

use chrono::{DateTime, Utc};
use palaver_protocol::{BroadcastFrame, InboundFrame, ProtocolError, RepliedMessage};

use crate::ids::{MessageId, RoomId, UserId};

/// Maximum length, in characters, of a reply snippet.
pub const SNIPPET_MAX_CHARS: usize = 120;

/// A validated, not-yet-persisted message from a client.
///
/// The sender is deliberately absent here: it is supplied by the session
/// from the identity established at admission, never taken from the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Message body, guaranteed non-empty.
    pub content: String,
    /// Message kind, e.g. "text".
    pub kind: String,
    /// Parsed reply reference, if the frame carried a well-formed one.
    pub reply_to: Option<MessageId>,
}

impl InboundMessage {
    /// Create a plain text message.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: "text".to_string(),
            reply_to: None,
        }
    }

    /// Set the message kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Set the reply reference.
    #[must_use]
    pub fn with_reply_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }

    /// Validate a decoded wire frame into a message.
    ///
    /// Returns `None` for empty content. A malformed reply reference is
    /// dropped rather than failing the frame.
    #[must_use]
    pub fn from_frame(frame: &InboundFrame) -> Option<Self> {
        if !frame.has_content() {
            return None;
        }
        Some(Self {
            content: frame.content.clone(),
            kind: frame.kind.clone(),
            reply_to: frame.reply_reference().map(MessageId::from),
        })
    }
}

/// A durably stored message, created exactly once per accepted inbound
/// message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    /// Store-generated id.
    pub id: MessageId,
    /// Room the message belongs to.
    pub chat_id: RoomId,
    /// Authenticated sender.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Message kind.
    pub kind: String,
    /// Server-assigned persistence time.
    pub timestamp: DateTime<Utc>,
    /// Reply reference carried over from the inbound message.
    pub reply_to: Option<MessageId>,
}

/// Denormalized summary of a replied-to message, resolved once before
/// fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplySummary {
    /// Id of the original message.
    pub id: MessageId,
    /// Sender of the original message.
    pub sender_id: UserId,
    /// Bounded snippet of the original content.
    pub snippet: String,
}

impl ReplySummary {
    /// Build a summary, bounding the snippet to [`SNIPPET_MAX_CHARS`].
    #[must_use]
    pub fn new(id: MessageId, sender_id: UserId, content: &str) -> Self {
        Self {
            id,
            sender_id,
            snippet: content.chars().take(SNIPPET_MAX_CHARS).collect(),
        }
    }
}

/// The wire-ready projection of a persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPayload {
    message: PersistedMessage,
    replied_to: Option<ReplySummary>,
}

impl BroadcastPayload {
    /// Create a payload from a persisted message and its resolved reply
    /// summary.
    #[must_use]
    pub fn new(message: PersistedMessage, replied_to: Option<ReplySummary>) -> Self {
        Self {
            message,
            replied_to,
        }
    }

    /// The persisted message this payload projects.
    #[must_use]
    pub fn message(&self) -> &PersistedMessage {
        &self.message
    }

    /// Project into the wire frame.
    #[must_use]
    pub fn to_frame(&self) -> BroadcastFrame {
        BroadcastFrame {
            id: self.message.id.as_uuid(),
            chat_id: self.message.chat_id.as_uuid(),
            sender_id: self.message.sender_id.as_uuid(),
            content: self.message.content.clone(),
            kind: self.message.kind.clone(),
            timestamp: self.message.timestamp,
            replied_to_message: self.replied_to.as_ref().map(|reply| RepliedMessage {
                id: reply.id.as_uuid(),
                sender_id: reply.sender_id.as_uuid(),
                content: reply.snippet.clone(),
            }),
        }
    }

    /// Encode the payload to JSON text, once per broadcast.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_frame().encode()
    }
}
