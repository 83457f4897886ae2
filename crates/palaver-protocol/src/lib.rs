//! # palaver-protocol
//!
//! Wire protocol definitions for the Palaver chat relay.
//!
//! This crate defines the JSON frames exchanged between clients and the
//! server, and the WebSocket close codes used when a connection is refused.
//!
//! ## Frame Types
//!
//! - [`InboundFrame`] - a message sent by a client into its room
//! - [`BroadcastFrame`] - a persisted message fanned out to the room
//! - [`ErrorNotice`] - out-of-band notice for an ignored frame
//!
//! ## Example
//!
//! ```rust
//! use palaver_protocol::InboundFrame;
//!
//! let frame = InboundFrame::decode(r#"{"content": "hi"}"#).unwrap();
//! assert!(frame.has_content());
//! assert_eq!(frame.kind, "text");
//! ```

pub mod frames;

pub use frames::{close, BroadcastFrame, ErrorNotice, InboundFrame, ProtocolError, RepliedMessage};
