//! # palaver-core
//!
//! Connection registry, room fan-out, and domain types for the Palaver
//! chat relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - live connections grouped by room
//! - **Broadcaster** - per-room fan-out with prune-on-failure
//! - **Message types** - inbound, persisted, and broadcast projections
//! - **Collaborator traits** - identity, membership, and persistence seams
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│ MessageStore│────▶│ Broadcaster │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                      Registry                       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Each session registers its connection once admitted, relays accepted
//! messages through the store and the broadcaster, and unregisters on exit.
//! The registry is the only state shared across connection tasks.

pub mod broadcast;
pub mod directory;
pub mod ids;
pub mod memory;
pub mod message;
pub mod registry;
pub mod sink;
pub mod store;

pub use broadcast::Broadcaster;
pub use directory::{IdentityResolver, RoomDirectory};
pub use ids::{ConnectionId, MessageId, RoomId, UserId};
pub use memory::{MemoryDirectory, MemoryStore};
pub use message::{BroadcastPayload, InboundMessage, PersistedMessage, ReplySummary};
pub use registry::{ConnectionHandle, Registry, RegistryStats};
pub use sink::{ConnectionSink, DeliveryError};
pub use store::{MessageStore, StoreError};
