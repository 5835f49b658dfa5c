//! Redis pub/sub bus.
//!
//! Publishing goes through a shared [`ConnectionManager`], which reconnects on
//! its own. Each subscription owns a dedicated pub/sub connection driven by a
//! background task that re-subscribes with exponential backoff whenever the
//! connection drops.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use crate::traits::{BusError, BusEvent, BusMessage, BusSubscription, BusTransport};

/// Capacity of each subscriber's delivery queue.
const SUBSCRIBER_QUEUE: usize = 4096;

/// Redis bus configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// First reconnect delay.
    pub reconnect_min: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            reconnect_min: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
        }
    }
}

/// Redis-backed bus transport.
pub struct RedisTransport {
    client: redis::Client,
    publisher: OnceCell<ConnectionManager>,
    healthy: Arc<AtomicBool>,
    config: RedisConfig,
}

impl RedisTransport {
    /// Create a transport. No connection is made until first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(config: RedisConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BusError::Config(e.to_string()))?;

        Ok(Self {
            client,
            publisher: OnceCell::new(),
            healthy: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    async fn publisher(&self) -> Result<ConnectionManager, BusError> {
        self.publisher
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!(url = %self.config.url, "Redis publisher connected");
                Ok::<_, redis::RedisError>(manager)
            })
            .await
            .cloned()
            .map_err(|e| {
                self.healthy.store(false, Ordering::Release);
                BusError::Unavailable(e.to_string())
            })
    }
}

#[async_trait]
impl BusTransport for RedisTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BusError> {
        let mut conn = self.publisher().await?;
        let receivers: usize = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(|e| {
                self.healthy.store(false, Ordering::Release);
                BusError::PublishFailed(e.to_string())
            })?;
        self.healthy.store(true, Ordering::Release);
        Ok(receivers)
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        tokio::spawn(run_subscriber(
            self.client.clone(),
            pattern.to_string(),
            tx,
            Arc::clone(&self.healthy),
            self.config.clone(),
        ));
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

async fn run_subscriber(
    client: redis::Client,
    pattern: String,
    tx: mpsc::Sender<BusEvent>,
    healthy: Arc<AtomicBool>,
    config: RedisConfig,
) {
    let mut backoff = config.reconnect_min;

    loop {
        let reason = match client.get_async_pubsub().await {
            Ok(mut pubsub) => match pubsub.psubscribe(&pattern).await {
                Ok(()) => {
                    info!(pattern = %pattern, "Redis subscription established");
                    healthy.store(true, Ordering::Release);
                    backoff = config.reconnect_min;
                    if tx.send(BusEvent::Connected).await.is_err() {
                        return;
                    }

                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let payload: Vec<u8> = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "Dropping undecodable Redis payload");
                                continue;
                            }
                        };
                        let message = BusMessage {
                            topic: msg.get_channel_name().to_string(),
                            payload: Bytes::from(payload),
                        };
                        if tx.send(BusEvent::Message(message)).await.is_err() {
                            debug!(pattern = %pattern, "Redis subscriber dropped");
                            return;
                        }
                    }
                    "subscription stream ended".to_string()
                }
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        warn!(pattern = %pattern, reason = %reason, backoff_ms = backoff.as_millis() as u64, "Redis subscription lost");
        healthy.store(false, Ordering::Release);
        if tx.send(BusEvent::Disconnected(reason)).await.is_err() {
            return;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url() {
        let result = RedisTransport::new(RedisConfig {
            url: "not a url".into(),
            ..Default::default()
        });
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[test]
    fn test_starts_unhealthy() {
        let transport = RedisTransport::new(RedisConfig::default()).unwrap();
        assert!(!transport.is_healthy());
        assert_eq!(transport.name(), "redis");
    }
}
