//! In-process bus.
//!
//! Every [`MemoryTransport`] handed out by the same [`MemoryBus`] sees the
//! others' publications, which makes it both the single-instance bus and the
//! way to run several engines side by side in one process. Availability can
//! be toggled to simulate an unreachable bus.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::traits::{topic_matches, BusError, BusEvent, BusMessage, BusSubscription, BusTransport};

/// Default capacity of the shared broadcast ring.
const DEFAULT_CAPACITY: usize = 4096;

/// Capacity of each subscriber's delivery queue.
const SUBSCRIBER_QUEUE: usize = 1024;

struct Inner {
    sender: broadcast::Sender<BusMessage>,
    available: watch::Sender<bool>,
}

/// A bus living inside the current process.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new bus with a specific ring capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (available, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner { sender, available }),
        }
    }

    /// Hand out a transport attached to this bus.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Make the bus reachable or unreachable for every attached transport.
    pub fn set_available(&self, available: bool) {
        let previous = self.inner.available.send_replace(available);
        if previous != available {
            debug!(available, "Memory bus availability changed");
        }
    }

    /// Check if the bus is reachable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        *self.inner.available.borrow()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One instance's handle on a [`MemoryBus`].
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BusError> {
        if !*self.inner.available.borrow() {
            return Err(BusError::Unavailable("memory bus is down".into()));
        }

        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        // No receivers is not an error: nobody is listening yet.
        Ok(self.inner.sender.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError> {
        let mut messages = self.inner.sender.subscribe();
        let mut available = self.inner.available.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut up = *available.borrow_and_update();
            let first = if up {
                BusEvent::Connected
            } else {
                BusEvent::Disconnected("memory bus is down".into())
            };
            if tx.send(first).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    changed = available.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now_up = *available.borrow_and_update();
                        if now_up == up {
                            continue;
                        }
                        up = now_up;
                        let event = if up {
                            BusEvent::Connected
                        } else {
                            BusEvent::Disconnected("memory bus is down".into())
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    received = messages.recv() => {
                        match received {
                            Ok(message) => {
                                // Partitioned subscribers miss traffic
                                if !up || !topic_matches(&pattern, &message.topic) {
                                    continue;
                                }
                                if tx.send(BusEvent::Message(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Memory bus subscriber lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_healthy(&self) -> bool {
        *self.inner.available.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_message(rx: &mut BusSubscription) -> BusMessage {
        loop {
            match rx.recv().await.expect("subscription closed") {
                BusEvent::Message(message) => return message,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = MemoryBus::new();
        let a = bus.transport();
        let b = bus.transport();

        let mut sub = b.subscribe("herald#*").await.unwrap();
        assert_eq!(sub.recv().await, Some(BusEvent::Connected));

        let receivers = a.publish("other#x", Bytes::from_static(b"skip")).await.unwrap();
        assert_eq!(receivers, 1);
        a.publish("herald#app-1", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let message = next_message(&mut sub).await;
        assert_eq!(message.topic, "herald#app-1");
        assert_eq!(&message.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_unavailable_bus() {
        let bus = MemoryBus::new();
        let transport = bus.transport();
        let mut sub = transport.subscribe("t*").await.unwrap();
        assert_eq!(sub.recv().await, Some(BusEvent::Connected));

        bus.set_available(false);
        assert!(!transport.is_healthy());
        assert!(matches!(
            transport.publish("t1", Bytes::new()).await,
            Err(BusError::Unavailable(_))
        ));
        assert!(matches!(sub.recv().await, Some(BusEvent::Disconnected(_))));

        bus.set_available(true);
        assert_eq!(sub.recv().await, Some(BusEvent::Connected));
        transport
            .publish("t1", Bytes::from_static(b"back"))
            .await
            .unwrap();
        assert_eq!(&next_message(&mut sub).await.payload[..], b"back");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::new();
        let receivers = bus
            .transport()
            .publish("nobody", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(receivers, 0);
    }
}
