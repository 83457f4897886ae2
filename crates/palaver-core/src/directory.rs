//! Admission-time collaborator contracts.
//!
//! These are the narrow seams to the identity and chat-membership systems.
//! Production deployments back them with the user/session and chat stores;
//! this repo ships in-memory implementations in [`crate::memory`].

use async_trait::async_trait;

use crate::ids::{RoomId, UserId};

/// Resolves a bearer credential to an authenticated user.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a credential, or `None` if it does not map to a user.
    async fn resolve(&self, credential: &str) -> Option<UserId>;
}

/// Answers room existence and participation questions.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Whether the room exists.
    async fn room_exists(&self, room: &RoomId) -> bool;

    /// Whether the user is an authorized participant of the room.
    async fn is_participant(&self, room: &RoomId, user: &UserId) -> bool;
}
