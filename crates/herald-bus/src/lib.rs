//! # herald-bus
//!
//! Horizontal bus abstraction for the Herald broadcasting server.
//!
//! Herald instances share channel traffic and presence state through a
//! publish/subscribe bus. This crate provides a unified interface over:
//!
//! - **Memory** - In-process, for single-instance deployments and tests
//! - **Redis** - Pub/sub across processes and hosts
//!
//! ## Bus Abstraction
//!
//! All buses implement the `BusTransport` trait, allowing the adapter to be
//! bus-agnostic.
//!
//! ```rust,ignore
//! use herald_bus::{BusEvent, BusTransport};
//!
//! async fn listen(bus: &dyn BusTransport) {
//!     let mut sub = bus.subscribe("herald#*").await.unwrap();
//!     while let Some(event) = sub.recv().await {
//!         // Process event
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{MemoryBus, MemoryTransport};
pub use traits::{topic_matches, BusError, BusEvent, BusMessage, BusSubscription, BusTransport};

#[cfg(feature = "redis")]
pub use self::redis::{RedisConfig, RedisTransport};
