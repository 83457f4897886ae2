//! Frame types for the Palaver wire protocol.
//!
//! The protocol is JSON text frames over a WebSocket. Clients send
//! [`InboundFrame`]s into a room; the server fans out [`BroadcastFrame`]s to
//! every live connection in that room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// WebSocket close codes used when a connection is refused at admission.
pub mod close {
    /// Credential missing or invalid, or the room id is malformed.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Room unknown, or the user is not a participant of it.
    pub const CANNOT_ACCEPT: u16 = 1003;
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not match the expected shape.
    #[error("failed to decode frame: {0}")]
    Decode(serde_json::Error),

    /// Frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),
}

/// A message frame sent by a client.
///
/// The sender identity is never part of the frame; the server always uses
/// the identity established at admission. The `timestamp` field is advisory
/// only and the server assigns the authoritative persisted timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Message body. Empty content is rejected by the server.
    #[serde(default)]
    pub content: String,

    /// Message kind, e.g. "text".
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,

    /// Id of the message this one replies to, as sent by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,

    /// Client-side send time. Ignored for persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

fn default_kind() -> String {
    "text".to_string()
}

impl InboundFrame {
    /// Create a plain text frame.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: default_kind(),
            reply_to_message_id: None,
            timestamp: None,
        }
    }

    /// Set the replied-to message id.
    #[must_use]
    pub fn with_reply_to(mut self, id: impl Into<String>) -> Self {
        self.reply_to_message_id = Some(id.into());
        self
    }

    /// Decode a frame from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON for this shape.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    /// Whether the frame carries any content.
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// Best-effort parse of the replied-to message id.
    ///
    /// A present but malformed id yields `None`; the frame is still relayed
    /// without the reply reference rather than rejected.
    #[must_use]
    pub fn reply_reference(&self) -> Option<Uuid> {
        self.reply_to_message_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// Denormalized summary of a replied-to message, embedded in a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepliedMessage {
    /// Id of the original message.
    pub id: Uuid,
    /// Sender of the original message.
    pub sender_id: Uuid,
    /// Content snippet of the original message.
    pub content: String,
}

/// A persisted message as delivered to every connection in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFrame {
    /// Server-generated message id.
    pub id: Uuid,
    /// Room the message belongs to.
    pub chat_id: Uuid,
    /// Authenticated sender.
    pub sender_id: Uuid,
    /// Message body.
    pub content: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Server-assigned persistence time.
    pub timestamp: DateTime<Utc>,
    /// Summary of the replied-to message, if any. Always present on the
    /// wire, `null` when the message is not a reply.
    pub replied_to_message: Option<RepliedMessage>,
}

impl BroadcastFrame {
    /// Encode the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Decode a frame from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON for this shape.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Out-of-band notice sent back to a client whose frame was ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Human-readable reason.
    pub error: String,
}

impl ErrorNotice {
    /// Create a new notice.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            error: reason.into(),
        }
    }

    /// Encode the notice to JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_inbound_frame() {
        let text = r#"{
            "content": "hello",
            "type": "text",
            "reply_to_message_id": "7f2c0a4e-7cf3-4d1b-9b6f-1d6f3a2b5c88",
            "timestamp": "2024-05-01T12:00:00Z"
        }"#;

        let frame = InboundFrame::decode(text).unwrap();
        assert_eq!(frame.content, "hello");
        assert_eq!(frame.kind, "text");
        assert!(frame.has_content());
        assert_eq!(
            frame.reply_reference(),
            Some(Uuid::parse_str("7f2c0a4e-7cf3-4d1b-9b6f-1d6f3a2b5c88").unwrap())
        );
    }

    #[test]
    fn test_decode_defaults() {
        // Missing kind defaults to "text"; missing content decodes as empty.
        let frame = InboundFrame::decode(r#"{"content": "hi"}"#).unwrap();
        assert_eq!(frame.kind, "text");

        let frame = InboundFrame::decode(r#"{}"#).unwrap();
        assert!(!frame.has_content());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            InboundFrame::decode("not json"),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            InboundFrame::decode(r#"[1, 2, 3]"#),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_malformed_reply_reference_degrades_to_none() {
        let frame = InboundFrame::text("hi").with_reply_to("definitely-not-a-uuid");
        assert!(frame.reply_to_message_id.is_some());
        assert_eq!(frame.reply_reference(), None);
    }

    #[test]
    fn test_broadcast_frame_carries_null_reply() {
        let frame = BroadcastFrame {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: "hello".to_string(),
            kind: "text".to_string(),
            timestamp: Utc::now(),
            replied_to_message: None,
        };

        let encoded = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        // The key must be present and null, not omitted.
        assert!(value["replied_to_message"].is_null());
        assert_eq!(value["type"], "text");
    }

    #[test]
    fn test_broadcast_frame_with_reply() {
        let original_id = Uuid::new_v4();
        let frame = BroadcastFrame {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: "agreed".to_string(),
            kind: "text".to_string(),
            timestamp: Utc::now(),
            replied_to_message: Some(RepliedMessage {
                id: original_id,
                sender_id: Uuid::new_v4(),
                content: "shall we?".to_string(),
            }),
        };

        let decoded = BroadcastFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.replied_to_message.unwrap().id, original_id);
    }

    #[test]
    fn test_error_notice() {
        let notice = ErrorNotice::new("Content cannot be empty");
        let encoded = notice.encode().unwrap();
        assert_eq!(encoded, r#"{"error":"Content cannot be empty"}"#);
    }
}
