//! # herald-core
//!
//! Channels, presence, authentication and horizontal fan-out for the
//! Herald broadcasting server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **App** - Tenants, their credentials and limits
//! - **Auth** - HMAC signatures for private channels and the HTTP API
//! - **ChannelManager** - Subscription state machine per (app, channel)
//! - **Presence** - Replicated member counters with exactly-once announcements
//! - **Broadcaster** - Encode-once fan-out to local subscribers
//! - **HorizontalAdapter** - Cluster traffic over a [`BusTransport`](tenvis_herald_bus::BusTransport)
//! - **Engine** - Everything wired together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────────┐     ┌──────────────┐
//! │   Session   │────▶│ ChannelManager │────▶│   Presence   │
//! └─────────────┘     └────────────────┘     └──────────────┘
//!        │                    │
//!        ▼                    ▼
//! ┌─────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ Broadcaster │────▶│   Horizontal   │────▶│     Bus      │
//! └─────────────┘     │    Adapter     │     └──────────────┘
//!                     └────────────────┘
//! ```

pub mod adapter;
pub mod app;
pub mod auth;
pub mod broadcaster;
pub mod channel;
pub mod channel_manager;
pub mod connection;
pub mod connection_manager;
pub mod engine;
pub mod message;
pub mod presence;
pub mod session;
pub mod webhook;

pub use adapter::{AdapterConfig, AdapterError, ClusterHandler, HorizontalAdapter};
pub use app::{App, AppRegistry, CachedAppRegistry, MemoryAppRegistry, RegistryError};
pub use broadcaster::{Broadcaster, PublishReceipt};
pub use channel::{ChannelKey, ChannelKind};
pub use channel_manager::{ChannelInfo, ChannelManager, SubscribeError, SubscriptionResult};
pub use connection::{Connection, Outbound, SocketId};
pub use connection_manager::{Accepted, ConnectError, ConnectionConfig, ConnectionManager};
pub use engine::{Engine, EngineConfig, TriggerError};
pub use message::Event;
pub use presence::{PresenceError, PresenceStore};
pub use session::{ClientEventError, Handled, Session, SessionError};
pub use webhook::{RecordingWebhookSink, TracingWebhookSink, WebhookEvent, WebhookSink};
