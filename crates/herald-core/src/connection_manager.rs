//! Connection lifecycle.
//!
//! The connection manager admits sockets, tracks every live connection and
//! runs the liveness sweep: an idle connection is pinged once after the
//! activity timeout and dropped with 4201 if nothing arrives within the
//! pong timeout.

use dashmap::DashMap;
use herald_protocol::{CloseCode, Frame};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::app::{AppRegistry, RegistryError};
use crate::channel_manager::ChannelManager;
use crate::connection::{Connection, Outbound, SendError, SocketId};
use crate::message::now_millis;

/// Reasons a socket is refused.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No app has this key.
    #[error("App not found")]
    AppNotFound,

    /// The app is disabled.
    #[error("App disabled")]
    AppDisabled,

    /// The app reached its connection quota.
    #[error("Connection quota exceeded")]
    OverQuota,

    /// The registry could not be queried.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ConnectError {
    /// Close code sent to the client.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            ConnectError::AppNotFound => CloseCode::AppNotFound,
            ConnectError::AppDisabled => CloseCode::AppDisabled,
            ConnectError::OverQuota => CloseCode::OverQuota,
            ConnectError::Registry(_) => CloseCode::OverCapacity,
        }
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle time after which the server pings.
    pub activity_timeout: Duration,
    /// Time allowed to answer the ping.
    pub pong_timeout: Duration,
    /// Period of the liveness sweep.
    pub sweep_interval: Duration,
    /// Frames buffered per connection before it counts as a slow consumer.
    pub outbound_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            outbound_queue: 1024,
        }
    }
}

/// An admitted connection and the frames waiting to be written to it.
#[derive(Debug)]
pub struct Accepted {
    pub connection: Arc<Connection>,
    pub outbound: Outbound,
}

/// Result of one liveness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub pinged: usize,
    pub timed_out: usize,
    pub reaped: usize,
}

/// Tracks every live connection.
pub struct ConnectionManager {
    registry: Arc<dyn AppRegistry>,
    channels: Arc<ChannelManager>,
    connections: DashMap<SocketId, Arc<Connection>>,
    per_app: DashMap<String, usize>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    /// Create a connection manager.
    #[must_use]
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        channels: Arc<ChannelManager>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            registry,
            channels,
            connections: DashMap::new(),
            per_app: DashMap::new(),
            config,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Admit a socket for the app with `app_key`.
    ///
    /// The returned queue already holds `pusher:connection_established`.
    ///
    /// # Errors
    ///
    /// Returns an error if the app is unknown or disabled, or its quota is
    /// reached.
    pub async fn accept(&self, app_key: &str) -> Result<Accepted, ConnectError> {
        let app = self
            .registry
            .find_by_key(app_key)
            .await?
            .ok_or(ConnectError::AppNotFound)?;
        if !app.enabled {
            return Err(ConnectError::AppDisabled);
        }

        {
            let mut count = self.per_app.entry(app.id.clone()).or_insert(0);
            if app.max_connections > 0 && *count >= app.max_connections {
                warn!(app = %app.id, max = app.max_connections, "Connection quota reached");
                return Err(ConnectError::OverQuota);
            }
            *count += 1;
        }

        let (connection, outbound) = Connection::new(app, self.config.outbound_queue);
        let established = Frame::connection_established(
            connection.socket_id(),
            self.config.activity_timeout.as_secs(),
        );
        if let Err(e) = connection.send(&established) {
            warn!(socket = %connection.socket_id(), error = %e, "Failed to queue connection_established");
        }

        self.connections
            .insert(connection.socket_id().to_string(), Arc::clone(&connection));
        debug!(app = %connection.app().id, socket = %connection.socket_id(), "Connection accepted");

        Ok(Accepted {
            connection,
            outbound,
        })
    }

    /// Look a connection up.
    #[must_use]
    pub fn get(&self, socket_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(socket_id).map(|c| Arc::clone(c.value()))
    }

    /// Record activity on a connection.
    pub fn heartbeat(&self, socket_id: &str) {
        if let Some(connection) = self.connections.get(socket_id) {
            connection.touch(now_millis());
        }
    }

    /// Close a connection and remove it from every channel.
    ///
    /// Returns `false` if the connection was already gone.
    pub fn disconnect(&self, socket_id: &str, code: CloseCode) -> bool {
        let Some((_, connection)) = self.connections.remove(socket_id) else {
            return false;
        };

        connection.close(code);
        self.channels.unsubscribe_all(&connection);

        let app_id = &connection.app().id;
        if let Some(mut count) = self.per_app.get_mut(app_id) {
            *count = count.saturating_sub(1);
        }
        self.per_app.remove_if(app_id, |_, count| *count == 0);

        debug!(app = %app_id, socket = %socket_id, code = code.code(), "Connection removed");
        true
    }

    /// Disconnect every connection.
    pub fn disconnect_all(&self, code: CloseCode) -> usize {
        let ids: Vec<SocketId> = self.connections.iter().map(|c| c.key().clone()).collect();
        ids.iter().filter(|id| self.disconnect(id, code)).count()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live connections of an app.
    #[must_use]
    pub fn app_connection_count(&self, app_id: &str) -> usize {
        self.per_app.get(app_id).map(|c| *c).unwrap_or(0)
    }

    /// Ping idle connections, drop unresponsive ones and reap closed ones.
    pub fn sweep(&self, now_ms: u64) -> SweepStats {
        let activity_ms = self.config.activity_timeout.as_millis() as u64;
        let deadline_ms = activity_ms + self.config.pong_timeout.as_millis() as u64;

        let mut stats = SweepStats::default();
        let mut timed_out = Vec::new();
        let mut reaped = Vec::new();

        for entry in self.connections.iter() {
            let connection = entry.value();
            if connection.is_closed() {
                reaped.push((entry.key().clone(), connection.close_code().unwrap_or(CloseCode::Normal)));
                continue;
            }

            let idle = now_ms.saturating_sub(connection.last_activity());
            if idle >= deadline_ms {
                timed_out.push(entry.key().clone());
            } else if idle >= activity_ms && connection.mark_ping_sent() {
                match connection.send(&Frame::ping()) {
                    Ok(()) => stats.pinged += 1,
                    Err(SendError::QueueFull) => {
                        connection.close(CloseCode::OverCapacity);
                    }
                    Err(_) => {}
                }
            }
        }

        for socket_id in timed_out {
            debug!(socket = %socket_id, "Pong timeout");
            if self.disconnect(&socket_id, CloseCode::PongTimeout) {
                stats.timed_out += 1;
            }
        }
        for (socket_id, code) in reaped {
            if self.disconnect(&socket_id, code) {
                stats.reaped += 1;
            }
        }

        stats
    }

    /// Run the sweep periodically.
    #[must_use]
    pub fn spawn_liveness_check(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            activity_timeout_s = self.config.activity_timeout.as_secs(),
            pong_timeout_s = self.config.pong_timeout.as_secs(),
            "Starting liveness check"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let stats = self.sweep(now_millis());
                if stats != SweepStats::default() {
                    debug!(?stats, "Liveness sweep");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterConfig, HorizontalAdapter};
    use crate::app::{App, MemoryAppRegistry};
    use crate::broadcaster::Broadcaster;
    use crate::channel::new_index;
    use crate::presence::PresenceStore;
    use crate::webhook::TracingWebhookSink;
    use herald_protocol::{codec, SubscribeRequest};
    use tenvis_herald_bus::MemoryBus;

    fn manager(apps: Vec<App>) -> (ConnectionManager, Arc<ChannelManager>) {
        let bus = MemoryBus::new();
        let adapter = HorizontalAdapter::new(Arc::new(bus.transport()), AdapterConfig::default());
        let index = new_index();
        let broadcaster = Arc::new(Broadcaster::new(index.clone(), adapter.clone()));
        let channels = Arc::new(ChannelManager::new(
            index,
            Arc::new(PresenceStore::new()),
            broadcaster,
            adapter,
            Arc::new(TracingWebhookSink),
        ));
        let config = ConnectionConfig {
            activity_timeout: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        (
            ConnectionManager::new(Arc::new(MemoryAppRegistry::new(apps)), channels.clone(), config),
            channels,
        )
    }

    #[tokio::test]
    async fn test_accept_sends_connection_established() {
        let (manager, _) = manager(vec![App::new("1", "key", "secret")]);
        let mut accepted = manager.accept("key").await.unwrap();

        let frame = codec::decode(&accepted.outbound.try_recv().unwrap()).unwrap();
        assert_eq!(frame.event, "pusher:connection_established");
        let data: serde_json::Value =
            serde_json::from_str(frame.data.unwrap().as_str().unwrap()).unwrap();
        assert_eq!(data["socket_id"], accepted.connection.socket_id());
        assert_eq!(data["activity_timeout"], 10);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_accept_rejections() {
        let disabled = App {
            enabled: false,
            ..App::new("2", "off", "secret")
        };
        let quota = App::new("3", "small", "secret").with_max_connections(1);
        let (manager, _) = manager(vec![disabled, quota]);

        assert_eq!(
            manager.accept("missing").await.unwrap_err().close_code(),
            CloseCode::AppNotFound
        );
        assert_eq!(
            manager.accept("off").await.unwrap_err().close_code(),
            CloseCode::AppDisabled
        );

        let first = manager.accept("small").await.unwrap();
        assert_eq!(
            manager.accept("small").await.unwrap_err().close_code(),
            CloseCode::OverQuota
        );
        manager.disconnect(first.connection.socket_id(), CloseCode::Normal);
        assert_eq!(manager.app_connection_count("3"), 0);
        assert!(manager.accept("small").await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_unsubscribes_everything() {
        let (manager, channels) = manager(vec![App::new("1", "key", "secret")]);
        let accepted = manager.accept("key").await.unwrap();
        let conn = accepted.connection.clone();
        for name in ["a", "b"] {
            let request = SubscribeRequest {
                channel: name.into(),
                ..Default::default()
            };
            channels.subscribe(&conn, &request).unwrap();
        }

        assert!(manager.disconnect(conn.socket_id(), CloseCode::Normal));
        assert!(!manager.disconnect(conn.socket_id(), CloseCode::Normal));
        assert!(conn.is_closed());
        assert_eq!(conn.channel_count(), 0);
        assert!(channels.channels("1", None).is_empty());
    }

    #[tokio::test]
    async fn test_sweep_pings_then_times_out() {
        let (manager, _) = manager(vec![App::new("1", "key", "secret")]);
        let mut accepted = manager.accept("key").await.unwrap();
        accepted.outbound.try_recv().unwrap();
        let start = accepted.connection.last_activity();

        assert_eq!(manager.sweep(start + 1_000), SweepStats::default());

        let stats = manager.sweep(start + 10_000);
        assert_eq!(stats.pinged, 1);
        let ping = codec::decode(&accepted.outbound.try_recv().unwrap()).unwrap();
        assert_eq!(ping.event, "pusher:ping");

        // Only one ping per idle period
        assert_eq!(manager.sweep(start + 12_000).pinged, 0);

        let stats = manager.sweep(start + 15_000);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(accepted.connection.close_code(), Some(CloseCode::PongTimeout));
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_activity_resets_idle_timer() {
        let (manager, _) = manager(vec![App::new("1", "key", "secret")]);
        let accepted = manager.accept("key").await.unwrap();
        let conn = accepted.connection.clone();
        let start = conn.last_activity();

        assert_eq!(manager.sweep(start + 10_000).pinged, 1);
        conn.touch(start + 11_000);
        assert_eq!(manager.sweep(start + 16_000), SweepStats::default());
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_reaps_closed_connections() {
        let (manager, _) = manager(vec![App::new("1", "key", "secret")]);
        let accepted = manager.accept("key").await.unwrap();
        accepted.connection.close(CloseCode::OverCapacity);

        let stats = manager.sweep(accepted.connection.last_activity());
        assert_eq!(stats.reaped, 1);
        assert_eq!(manager.connection_count(), 0);
    }
}
