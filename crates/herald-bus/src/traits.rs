//! Bus abstraction traits for Herald.
//!
//! A bus carries opaque payloads between Herald instances. Implementations
//! only move bytes; the meaning of a payload belongs to the adapter on top.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// A payload received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the payload was published to.
    pub topic: String,
    /// Opaque payload.
    pub payload: Bytes,
}

/// Events delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The subscription is (re-)established; messages published from now on
    /// will be delivered.
    Connected,
    /// A message matching the subscription pattern.
    Message(BusMessage),
    /// The subscription was lost; messages published meanwhile are missed.
    Disconnected(String),
}

/// Receiving side of a bus subscription.
pub type BusSubscription = mpsc::Receiver<BusEvent>;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus cannot be reached.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// Failed to publish a payload.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Failed to subscribe.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Invalid bus configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// A publish/subscribe bus shared by every instance of a cluster.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publish a payload to a topic.
    ///
    /// Returns the number of bus subscribers that accepted the payload,
    /// including this instance's own subscription when it matches.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BusError>;

    /// Subscribe to every topic matching `pattern`.
    ///
    /// Patterns are exact topic names or a prefix followed by `*`.
    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError>;

    /// Get the bus name (e.g., "memory", "redis").
    fn name(&self) -> &'static str;

    /// Check if the bus is currently reachable.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Check whether `topic` matches a subscription `pattern`.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("herald#*", "herald#app-1"));
        assert!(topic_matches("herald#*", "herald#~cluster"));
        assert!(!topic_matches("herald#*", "other#app-1"));
        assert!(topic_matches("herald#app-1", "herald#app-1"));
        assert!(!topic_matches("herald#app-1", "herald#app-2"));
    }
}
