//! Event fan-out.
//!
//! Every event is serialized once and the same `Arc<str>` is queued on each
//! local subscriber. Queues are bounded and never awaited: a subscriber
//! whose queue is full is closed as a slow consumer instead of slowing the
//! channel down.

use herald_protocol::{codec, CloseCode, Frame, MemberData};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::adapter::HorizontalAdapter;
use crate::channel::{ChannelIndex, ChannelKey};
use crate::connection::SendError;
use crate::message::Event;

/// Outcome of publishing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReceipt {
    /// Local subscribers the event was queued for.
    pub delivered: usize,
    /// Instances that accepted the event, at least this one.
    pub instances: usize,
}

/// Delivers events to local subscribers and hands them to the cluster.
pub struct Broadcaster {
    index: ChannelIndex,
    adapter: Arc<HorizontalAdapter>,
}

impl Broadcaster {
    /// Create a broadcaster reading from `index`.
    #[must_use]
    pub fn new(index: ChannelIndex, adapter: Arc<HorizontalAdapter>) -> Self {
        Self { index, adapter }
    }

    /// Deliver locally, then forward to the other instances.
    ///
    /// A bus failure only affects remote delivery.
    pub async fn publish(&self, event: Event) -> PublishReceipt {
        let delivered = self.deliver_local(&event);
        let instances = match self.adapter.broadcast(&event).await {
            Ok(receivers) => receivers.max(1),
            Err(_) => 1,
        };
        trace!(app = %event.app_id, channel = %event.channel, event = %event.name, delivered, instances, "Published event");
        PublishReceipt {
            delivered,
            instances,
        }
    }

    /// Deliver to local subscribers only.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn deliver_local(&self, event: &Event) -> usize {
        let key = ChannelKey::new(event.app_id.clone(), event.channel.clone());
        self.deliver(&key, &event.to_frame(), event.except.as_deref())
    }

    /// Tell local subscribers a member appeared.
    pub fn announce_member_added(
        &self,
        key: &ChannelKey,
        member: &MemberData,
        except: Option<&str>,
    ) -> usize {
        self.deliver(key, &Frame::member_added(key.channel.clone(), member), except)
    }

    /// Tell local subscribers a member left.
    pub fn announce_member_removed(&self, key: &ChannelKey, user_id: &str) -> usize {
        self.deliver(key, &Frame::member_removed(key.channel.clone(), user_id), None)
    }

    fn deliver(&self, key: &ChannelKey, frame: &Frame, except: Option<&str>) -> usize {
        let text: Arc<str> = match codec::encode(frame) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(channel = %key, error = %e, "Failed to encode frame");
                return 0;
            }
        };

        let Some(channel) = self.index.get(key) else {
            trace!(channel = %key, "No local subscribers");
            return 0;
        };

        let mut delivered = 0;
        for connection in channel.subscribers() {
            if except == Some(connection.socket_id()) {
                continue;
            }
            match connection.send_raw(Arc::clone(&text)) {
                Ok(()) => delivered += 1,
                Err(SendError::QueueFull) => {
                    warn!(channel = %key, socket = %connection.socket_id(), "Slow consumer, closing connection");
                    connection.close(CloseCode::OverCapacity);
                }
                Err(e) => trace!(socket = %connection.socket_id(), error = %e, "Skipping connection"),
            }
        }
        delivered
    }
}
