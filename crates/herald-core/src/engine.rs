//! The engine: every core component wired together.
//!
//! An [`Engine`] is what a server embeds. It owns the channel index, the
//! presence store, the broadcaster, the connection manager and the
//! horizontal adapter, and it is the [`ClusterHandler`] the adapter feeds.

use herald_protocol::cluster::SnapshotEntry;
use herald_protocol::{CloseCode, MemberData};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tenvis_herald_bus::BusTransport;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterConfig, AdapterError, ClusterHandler, HorizontalAdapter};
use crate::app::{App, AppRegistry};
use crate::broadcaster::{Broadcaster, PublishReceipt};
use crate::channel::{new_index, validate_channel_name, ChannelKey};
use crate::channel_manager::ChannelManager;
use crate::connection::Connection;
use crate::connection_manager::{ConnectionConfig, ConnectionManager};
use crate::message::Event;
use crate::presence::PresenceStore;
use crate::session::Session;
use crate::webhook::WebhookSink;

/// Most channels one trigger may address.
pub const MAX_TRIGGER_CHANNELS: usize = 100;

/// Longest accepted event name.
pub const MAX_EVENT_NAME_LENGTH: usize = 200;

/// Reasons a backend trigger is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("No channels given")]
    NoChannels,

    #[error("Too many channels ({0}, max {MAX_TRIGGER_CHANNELS})")]
    TooManyChannels(usize),

    #[error("Invalid channel {channel}: {reason}")]
    InvalidChannel {
        channel: String,
        reason: &'static str,
    },

    #[error("Invalid event name")]
    InvalidEventName,

    /// The payload exceeds the app's limit.
    #[error("Payload of {size} bytes exceeds {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub adapter: AdapterConfig,
    pub connection: ConnectionConfig,
}

/// Size of a payload as clients will see it.
#[must_use]
pub fn payload_size(data: &Value) -> usize {
    match data {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    }
}

/// The realtime engine.
pub struct Engine {
    registry: Arc<dyn AppRegistry>,
    adapter: Arc<HorizontalAdapter>,
    broadcaster: Arc<Broadcaster>,
    channels: Arc<ChannelManager>,
    connections: Arc<ConnectionManager>,
    webhooks: Arc<dyn WebhookSink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine on top of `bus`. Call [`start`](Self::start) to join
    /// the cluster.
    #[must_use]
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        bus: Arc<dyn BusTransport>,
        webhooks: Arc<dyn WebhookSink>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let adapter = HorizontalAdapter::new(bus, config.adapter);
        let index = new_index();
        let broadcaster = Arc::new(Broadcaster::new(index.clone(), Arc::clone(&adapter)));
        let channels = Arc::new(ChannelManager::new(
            index,
            Arc::new(PresenceStore::new()),
            Arc::clone(&broadcaster),
            Arc::clone(&adapter),
            Arc::clone(&webhooks),
        ));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            Arc::clone(&channels),
            config.connection,
        ));

        Arc::new(Self {
            registry,
            adapter,
            broadcaster,
            channels,
            connections,
            webhooks,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Join the cluster and start the liveness sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscription fails or the engine was
    /// already started.
    pub async fn start(&self) -> Result<(), AdapterError> {
        let bridge = Arc::new(ClusterBridge {
            channels: Arc::clone(&self.channels),
            broadcaster: Arc::clone(&self.broadcaster),
        });
        let mut handles = self.adapter.start(bridge).await?;
        handles.push(Arc::clone(&self.connections).spawn_liveness_check());

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        info!(node = %self.adapter.node_id(), bus = self.adapter.bus_name(), "Engine started");
        Ok(())
    }

    /// Check a trigger without publishing anything.
    ///
    /// # Errors
    ///
    /// Returns the first invalid channel name, event name or payload size.
    pub fn validate_trigger(
        app: &App,
        channels: &[String],
        name: &str,
        data: &Value,
    ) -> Result<(), TriggerError> {
        if channels.is_empty() {
            return Err(TriggerError::NoChannels);
        }
        if channels.len() > MAX_TRIGGER_CHANNELS {
            return Err(TriggerError::TooManyChannels(channels.len()));
        }
        for channel in channels {
            validate_channel_name(channel).map_err(|reason| TriggerError::InvalidChannel {
                channel: channel.clone(),
                reason,
            })?;
        }
        if name.is_empty() || name.len() > MAX_EVENT_NAME_LENGTH {
            return Err(TriggerError::InvalidEventName);
        }
        let size = payload_size(data);
        if size > app.max_payload_bytes {
            return Err(TriggerError::PayloadTooLarge {
                size,
                max: app.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Publish an event from a backend to one or more channels.
    ///
    /// `except` excludes one socket, usually the one whose action caused
    /// the event.
    ///
    /// # Errors
    ///
    /// Returns an error, before anything is published, if any channel name,
    /// the event name or the payload size is invalid.
    pub async fn trigger(
        &self,
        app: &App,
        channels: &[String],
        name: &str,
        data: Value,
        except: Option<String>,
    ) -> Result<PublishReceipt, TriggerError> {
        Self::validate_trigger(app, channels, name, &data)?;

        let mut total = PublishReceipt::default();
        for channel in channels {
            let event = Event::new(app.id.clone(), channel.clone(), name, data.clone())
                .excluding(except.clone());
            let receipt = self.broadcaster.publish(event).await;
            total.delivered += receipt.delivered;
            total.instances = total.instances.max(receipt.instances);
        }

        debug!(app = %app.id, event = %name, channels = channels.len(), delivered = total.delivered, "Triggered event");
        Ok(total)
    }

    /// Frame handler for an accepted connection.
    #[must_use]
    pub fn session(self: &Arc<Self>, connection: Arc<Connection>) -> Session {
        Session::new(connection, Arc::clone(self))
    }

    /// Leave the cluster and close every connection.
    pub async fn shutdown(&self) {
        // Stop mirroring first so nothing follows the goodbye
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        let closed = self.connections.disconnect_all(CloseCode::Normal);
        if let Err(e) = self.adapter.goodbye().await {
            warn!(error = %e, "Failed to publish goodbye");
        }
        info!(node = %self.adapter.node_id(), connections = closed, "Engine stopped");
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn AppRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn adapter(&self) -> &Arc<HorizontalAdapter> {
        &self.adapter
    }

    #[must_use]
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    #[must_use]
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    #[must_use]
    pub fn webhooks(&self) -> &Arc<dyn WebhookSink> {
        &self.webhooks
    }
}

/// Applies traffic from other instances to local state.
struct ClusterBridge {
    channels: Arc<ChannelManager>,
    broadcaster: Arc<Broadcaster>,
}

impl ClusterHandler for ClusterBridge {
    fn on_broadcast(&self, event: Event) {
        self.broadcaster.deliver_local(&event);
    }

    fn on_presence_join(&self, node: &str, app_id: &str, channel: &str, member: MemberData) {
        self.channels
            .apply_remote_join(node, &ChannelKey::new(app_id, channel), &member);
    }

    fn on_presence_leave(&self, node: &str, app_id: &str, channel: &str, user_id: &str) {
        self.channels
            .apply_remote_leave(node, &ChannelKey::new(app_id, channel), user_id);
    }

    fn on_occupancy(&self, node: &str, app_id: &str, channel: &str, delta: i64) {
        self.channels
            .apply_remote_occupancy(node, ChannelKey::new(app_id, channel), delta);
    }

    fn on_snapshot(&self, node: &str, entries: Vec<SnapshotEntry>) {
        self.channels.apply_snapshot(node, entries);
    }

    fn on_node_lost(&self, node: &str) {
        self.channels.drop_node(node);
    }

    fn local_snapshot(&self) -> Vec<SnapshotEntry> {
        self.channels.local_snapshot()
    }
}
