//! # herald-protocol
//!
//! Wire protocol definitions for the Herald broadcasting server.
//!
//! Herald speaks the Pusher channels protocol so existing client libraries
//! connect unmodified. This crate defines the JSON frames exchanged with
//! clients, the close codes, version negotiation, and the MessagePack
//! messages instances exchange over the horizontal bus.
//!
//! ## Frame Types
//!
//! - `pusher:subscribe` / `pusher:unsubscribe` - Channel membership
//! - `pusher_internal:member_added` / `member_removed` - Presence
//! - `client-*` - Events relayed between clients
//! - `pusher:ping` / `pusher:pong` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, ClientMessage, Frame};
//!
//! let frame = Frame::channel_event("score-update", "game-1", serde_json::json!({"score": 42}));
//! let text = codec::encode(&frame).unwrap();
//! assert!(text.contains("score-update"));
//!
//! let msg = codec::decode_client(r#"{"event":"pusher:subscribe","data":{"channel":"game-1"}}"#).unwrap();
//! assert!(matches!(msg, ClientMessage::Subscribe(_)));
//! ```

pub mod close;
pub mod cluster;
pub mod codec;
pub mod frames;
pub mod version;

pub use close::CloseCode;
pub use cluster::{ClusterBody, ClusterMessage};
pub use codec::{decode, encode, ProtocolError};
pub use frames::{events, ClientMessage, Frame, MemberData, SubscribeRequest};
pub use version::PROTOCOL_VERSION;
