//! Events flowing through Herald.
//!
//! An [`Event`] is what backend publishers and client events produce and
//! what the broadcaster fans out, locally and across the cluster.

use herald_protocol::{ClusterBody, Frame};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique event identifier.
pub type EventId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique event ID.
#[must_use]
pub fn generate_event_id() -> EventId {
    let timestamp = now_nanos();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// An event addressed to one channel of one app.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,
    /// App the channel belongs to.
    pub app_id: String,
    /// Target channel.
    pub channel: String,
    /// Event name.
    pub name: String,
    /// Event payload.
    pub data: Value,
    /// Socket that must not receive the event (usually the sender).
    pub except: Option<String>,
    /// Sender of a client event on a presence channel.
    pub user_id: Option<String>,
    /// Creation time in milliseconds.
    pub timestamp: u64,
}

impl Event {
    /// Create a new event.
    #[must_use]
    pub fn new(
        app_id: impl Into<String>,
        channel: impl Into<String>,
        name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: generate_event_id(),
            app_id: app_id.into(),
            channel: channel.into(),
            name: name.into(),
            data,
            except: None,
            user_id: None,
            timestamp: now_millis(),
        }
    }

    /// Exclude a socket from delivery.
    #[must_use]
    pub fn excluding(mut self, socket_id: Option<String>) -> Self {
        self.except = socket_id;
        self
    }

    /// Attach the sending user.
    #[must_use]
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// The frame delivered to subscribers.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::channel_event(self.name.clone(), self.channel.clone(), self.data.clone())
            .with_user_id(self.user_id.clone())
    }

    /// The cluster body carrying this event to other instances.
    #[must_use]
    pub fn to_cluster_body(&self) -> ClusterBody {
        ClusterBody::Broadcast {
            channel: self.channel.clone(),
            event: self.name.clone(),
            data: self.data.clone(),
            except: self.except.clone(),
            user_id: self.user_id.clone(),
        }
    }

    /// Rebuild an event received from another instance.
    ///
    /// Returns `None` when the body is not a broadcast.
    #[must_use]
    pub fn from_cluster_body(app_id: &str, body: ClusterBody) -> Option<Self> {
        match body {
            ClusterBody::Broadcast {
                channel,
                event,
                data,
                except,
                user_id,
            } => Some(
                Self::new(app_id, channel, event, data)
                    .excluding(except)
                    .with_user_id(user_id),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_ids_unique() {
        let a = Event::new("app", "c", "e", Value::Null);
        let b = Event::new("app", "c", "e", Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_event_frame() {
        let event = Event::new("app", "presence-room", "client-typing", json!({"on": true}))
            .with_user_id(Some("42".into()));
        let frame = event.to_frame();
        assert_eq!(frame.event, "client-typing");
        assert_eq!(frame.channel.as_deref(), Some("presence-room"));
        assert_eq!(frame.user_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_cluster_body_roundtrip() {
        let event = Event::new("app-1", "game-1", "score-update", json!({"score": 42}))
            .excluding(Some("1.1".into()));
        let rebuilt = Event::from_cluster_body("app-1", event.to_cluster_body()).unwrap();
        assert_eq!(rebuilt.channel, "game-1");
        assert_eq!(rebuilt.except.as_deref(), Some("1.1"));
        assert_eq!(rebuilt.data, json!({"score": 42}));

        assert!(Event::from_cluster_body("app-1", ClusterBody::Heartbeat).is_none());
    }
}
