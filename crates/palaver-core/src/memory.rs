//! In-memory collaborator implementations.
//!
//! [`MemoryDirectory`] and [`MemoryStore`] back the admission and
//! persistence contracts for tests and for the default server wiring.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};

use crate::directory::{IdentityResolver, RoomDirectory};
use crate::ids::{MessageId, RoomId, UserId};
use crate::message::{InboundMessage, PersistedMessage, ReplySummary};
use crate::store::{MessageStore, StoreError};

/// In-memory identity and room membership tables.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    tokens: DashMap<String, UserId>,
    rooms: DashMap<RoomId, DashSet<UserId>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a bearer token to a user.
    pub fn insert_token(&self, token: impl Into<String>, user: UserId) {
        self.tokens.insert(token.into(), user);
    }

    /// Create a room with no participants.
    pub fn create_room(&self, room: RoomId) {
        self.rooms.entry(room).or_default();
    }

    /// Add a participant to a room, creating the room if absent.
    pub fn add_participant(&self, room: RoomId, user: UserId) {
        self.rooms.entry(room).or_default().insert(user);
    }
}

#[async_trait]
impl IdentityResolver for MemoryDirectory {
    async fn resolve(&self, credential: &str) -> Option<UserId> {
        self.tokens.get(credential).map(|user| *user)
    }
}

#[async_trait]
impl RoomDirectory for MemoryDirectory {
    async fn room_exists(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    async fn is_participant(&self, room: &RoomId, user: &UserId) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(user))
            .unwrap_or(false)
    }
}

/// In-memory message store keyed by message id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<MessageId, PersistedMessage>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Fetch a persisted message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<PersistedMessage> {
        self.messages.get(id).map(|message| message.clone())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist(
        &self,
        message: InboundMessage,
        room: RoomId,
        sender: UserId,
    ) -> Result<PersistedMessage, StoreError> {
        let record = PersistedMessage {
            id: MessageId::generate(),
            chat_id: room,
            sender_id: sender,
            content: message.content,
            kind: message.kind,
            timestamp: Utc::now(),
            reply_to: message.reply_to,
        };
        self.messages.insert(record.id, record.clone());
        Ok(record)
    }

    async fn resolve_reply(&self, id: &MessageId) -> Option<ReplySummary> {
        self.messages
            .get(id)
            .map(|original| ReplySummary::new(original.id, original.sender_id, &original.content))
    }
}
