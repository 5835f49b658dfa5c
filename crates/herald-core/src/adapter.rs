//! Horizontal adapter: the bridge between this instance and the bus.
//!
//! App traffic goes to `<prefix>#<app_id>`, control traffic to
//! `<prefix>#~cluster`, and every instance listens on `<prefix>#*`.
//!
//! Presence and occupancy mirrors are deltas, so their order matters. They go
//! through a single outbox drained by one task, which keeps them in the order
//! the shard locks produced them. State changes hold a shared
//! [`MirrorSection`] while they mutate and enqueue; a snapshot is captured
//! and enqueued under the exclusive side of the same gate. A snapshot thus
//! reflects exactly the mirrors queued before it, and peers that replace a
//! node's state with it never apply a delta twice.

use bytes::Bytes;
use dashmap::DashMap;
use herald_protocol::cluster::{self, SnapshotEntry};
use herald_protocol::{ClusterBody, ClusterMessage, MemberData, ProtocolError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;
use tenvis_herald_bus::{BusError, BusEvent, BusSubscription, BusTransport};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::message::Event;

/// Topic suffix for control traffic.
const CLUSTER_TOPIC: &str = "~cluster";

/// Adapter errors.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The bus rejected the operation.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// A message could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] ProtocolError),

    /// `start` was called twice.
    #[error("Adapter already started")]
    AlreadyStarted,
}

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Topic prefix shared by the cluster.
    pub prefix: String,
    /// This instance's id.
    pub node_id: String,
    pub heartbeat_interval: Duration,
    /// Silence after which a node is considered gone.
    pub node_timeout: Duration,
    /// Period of full snapshot republication.
    pub resync_interval: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            prefix: "herald".to_string(),
            node_id: generate_node_id(),
            heartbeat_interval: Duration::from_secs(5),
            node_timeout: Duration::from_secs(15),
            resync_interval: Duration::from_secs(30),
        }
    }
}

/// Generate a random node id.
#[must_use]
pub fn generate_node_id() -> String {
    format!("node-{:016x}", rand::random::<u64>())
}

/// Receiver of traffic from other instances.
///
/// Every call concerns a message whose origin is another node.
pub trait ClusterHandler: Send + Sync {
    /// An event to deliver to local subscribers only.
    fn on_broadcast(&self, event: Event);

    fn on_presence_join(&self, node: &str, app_id: &str, channel: &str, member: MemberData);

    fn on_presence_leave(&self, node: &str, app_id: &str, channel: &str, user_id: &str);

    fn on_occupancy(&self, node: &str, app_id: &str, channel: &str, delta: i64);

    /// Replace everything `node` contributes.
    fn on_snapshot(&self, node: &str, entries: Vec<SnapshotEntry>);

    /// `node` left or stopped answering.
    fn on_node_lost(&self, node: &str);

    /// This instance's own state, for snapshots.
    fn local_snapshot(&self) -> Vec<SnapshotEntry>;
}

enum Outgoing {
    Mirror(ClusterMessage),
    Snapshot(Vec<SnapshotEntry>),
}

/// Shared hold on the mirror gate, taken around a local state change and
/// the mirrors it enqueues.
pub struct MirrorSection<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Bridge between the local engine and the bus.
pub struct HorizontalAdapter {
    bus: Arc<dyn BusTransport>,
    config: AdapterConfig,
    outbox: mpsc::UnboundedSender<Outgoing>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    mirror_gate: RwLock<()>,
    /// Source of local state for snapshots, set by `start`.
    snapshot_source: OnceLock<Weak<dyn ClusterHandler>>,
    /// Other nodes and when they were last heard from.
    nodes: DashMap<String, Instant>,
    publish_failed: AtomicBool,
    subscription_down: AtomicBool,
}

impl HorizontalAdapter {
    /// Create an adapter. Nothing is sent or received until [`start`](Self::start).
    #[must_use]
    pub fn new(bus: Arc<dyn BusTransport>, config: AdapterConfig) -> Arc<Self> {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        info!(node = %config.node_id, bus = bus.name(), prefix = %config.prefix, "Creating horizontal adapter");
        Arc::new(Self {
            bus,
            config,
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            mirror_gate: RwLock::new(()),
            snapshot_source: OnceLock::new(),
            nodes: DashMap::new(),
            publish_failed: AtomicBool::new(false),
            subscription_down: AtomicBool::new(true),
        })
    }

    /// Get this instance's node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Get the bus name.
    #[must_use]
    pub fn bus_name(&self) -> &'static str {
        self.bus.name()
    }

    /// Topic carrying an app's traffic.
    #[must_use]
    pub fn app_topic(&self, app_id: &str) -> String {
        format!("{}#{}", self.config.prefix, app_id)
    }

    /// Topic carrying control traffic.
    #[must_use]
    pub fn cluster_topic(&self) -> String {
        format!("{}#{}", self.config.prefix, CLUSTER_TOPIC)
    }

    fn pattern(&self) -> String {
        format!("{}#*", self.config.prefix)
    }

    /// Check if the bus is failing.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.publish_failed.load(Ordering::Relaxed) || self.subscription_down.load(Ordering::Relaxed)
    }

    /// Nodes currently known to be alive, sorted.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.nodes.iter().map(|n| n.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// Publish a message on a topic.
    ///
    /// Returns the number of bus subscribers that accepted it.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the bus rejects the message.
    pub async fn publish(&self, topic: &str, message: &ClusterMessage) -> Result<usize, AdapterError> {
        let payload = cluster::encode(message)?;
        match self.bus.publish(topic, Bytes::from(payload)).await {
            Ok(receivers) => {
                if self.publish_failed.swap(false, Ordering::Relaxed) {
                    info!(node = %self.config.node_id, "Bus publishing restored");
                }
                trace!(topic = %topic, kind = message.kind(), receivers, "Published to bus");
                Ok(receivers)
            }
            Err(e) => {
                if self.publish_failed.swap(true, Ordering::Relaxed) {
                    debug!(topic = %topic, error = %e, "Bus publish failed");
                } else {
                    warn!(topic = %topic, error = %e, "Bus publish failed, entering degraded mode");
                }
                Err(e.into())
            }
        }
    }

    /// Send an event to every other instance.
    ///
    /// Returns the number of instances that accepted it, this one included
    /// when it is subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is unavailable.
    pub async fn broadcast(&self, event: &Event) -> Result<usize, AdapterError> {
        let message = ClusterMessage::new(
            self.config.node_id.clone(),
            event.app_id.clone(),
            event.to_cluster_body(),
        );
        self.publish(&self.app_topic(&event.app_id), &message).await
    }

    /// Enter a section in which local state changes and their mirrors are
    /// produced. No snapshot is captured while any section is open.
    ///
    /// Lock order: mirror section, then channel index, then presence store.
    #[must_use]
    pub fn mirror_section(&self) -> MirrorSection<'_> {
        MirrorSection {
            _guard: self.mirror_gate.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Queue a presence or occupancy mirror.
    ///
    /// Mirrors are published in the order they are enqueued. Callers hold a
    /// [`MirrorSection`] spanning the state change the mirror describes.
    pub fn enqueue(&self, app_id: &str, body: ClusterBody) {
        let message = ClusterMessage::new(self.config.node_id.clone(), app_id, body);
        if self.outbox.send(Outgoing::Mirror(message)).is_err() {
            trace!("Outbox closed, mirror dropped");
        }
    }

    /// Capture this instance's state and queue it as a snapshot.
    ///
    /// Does nothing before [`start`](Self::start).
    pub fn request_snapshot(&self) {
        let Some(source) = self.snapshot_source.get().and_then(Weak::upgrade) else {
            trace!("Adapter not started, snapshot skipped");
            return;
        };
        let _gate = self.mirror_gate.write().unwrap_or_else(PoisonError::into_inner);
        let entries = source.local_snapshot();
        if self.outbox.send(Outgoing::Snapshot(entries)).is_err() {
            trace!("Outbox closed, snapshot dropped");
        }
    }

    /// Ask `target` (or every node) for a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is unavailable.
    pub async fn request_sync(&self, target: Option<String>) -> Result<(), AdapterError> {
        let message = ClusterMessage::new(
            self.config.node_id.clone(),
            "",
            ClusterBody::SyncRequest { target },
        );
        self.publish(&self.cluster_topic(), &message).await?;
        Ok(())
    }

    /// Tell the cluster this node is leaving.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is unavailable.
    pub async fn goodbye(&self) -> Result<(), AdapterError> {
        let message = ClusterMessage::new(self.config.node_id.clone(), "", ClusterBody::Goodbye);
        self.publish(&self.cluster_topic(), &message).await?;
        info!(node = %self.config.node_id, "Goodbye published");
        Ok(())
    }

    /// Subscribe to the bus and spawn the receive, outbox and maintenance tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription fails or the adapter was
    /// already started.
    pub async fn start(
        self: &Arc<Self>,
        handler: Arc<dyn ClusterHandler>,
    ) -> Result<Vec<JoinHandle<()>>, AdapterError> {
        let outbox_rx = self
            .outbox_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(AdapterError::AlreadyStarted)?;
        let _ = self.snapshot_source.set(Arc::downgrade(&handler));

        let subscription = self.bus.subscribe(&self.pattern()).await?;
        info!(node = %self.config.node_id, pattern = %self.pattern(), "Horizontal adapter started");

        Ok(vec![
            tokio::spawn(Arc::clone(self).receive_loop(subscription, Arc::clone(&handler))),
            tokio::spawn(Arc::clone(self).outbox_loop(outbox_rx)),
            tokio::spawn(Arc::clone(self).maintenance_loop(handler)),
        ])
    }

    async fn receive_loop(self: Arc<Self>, mut subscription: BusSubscription, handler: Arc<dyn ClusterHandler>) {
        while let Some(event) = subscription.recv().await {
            match event {
                BusEvent::Connected => {
                    if self.subscription_down.swap(false, Ordering::Relaxed) {
                        info!(node = %self.config.node_id, "Bus subscription established");
                    }
                    // Whatever we missed is recovered from snapshots
                    if let Err(e) = self.request_sync(None).await {
                        warn!(error = %e, "Sync request failed");
                    }
                    self.request_snapshot();
                }
                BusEvent::Disconnected(reason) => {
                    self.subscription_down.store(true, Ordering::Relaxed);
                    error!(node = %self.config.node_id, reason = %reason, "Bus subscription lost, entering degraded mode");
                }
                BusEvent::Message(message) => match cluster::decode(&message.payload) {
                    Ok(decoded) => self.dispatch(decoded, handler.as_ref()).await,
                    Err(e) => warn!(topic = %message.topic, error = %e, "Dropping undecodable bus message"),
                },
            }
        }
        error!(node = %self.config.node_id, "Bus subscription ended");
    }

    async fn dispatch(&self, message: ClusterMessage, handler: &dyn ClusterHandler) {
        if message.node_id == self.config.node_id {
            return;
        }
        let node = message.node_id.as_str();
        trace!(node = %node, kind = message.kind(), "Cluster message received");

        if matches!(message.body, ClusterBody::Goodbye) {
            if self.nodes.remove(node).is_some() {
                info!(node = %node, "Node left the cluster");
            }
            handler.on_node_lost(node);
            return;
        }

        let is_new = self.nodes.insert(node.to_string(), Instant::now()).is_none();
        if is_new {
            info!(node = %node, "Node joined the cluster");
            if !matches!(message.body, ClusterBody::Snapshot { .. }) {
                if let Err(e) = self.request_sync(Some(node.to_string())).await {
                    warn!(node = %node, error = %e, "Sync request failed");
                }
            }
        }

        let app_id = message.app_id.as_str();
        match message.body {
            ClusterBody::Broadcast { .. } => {
                if let Some(event) = Event::from_cluster_body(app_id, message.body) {
                    handler.on_broadcast(event);
                }
            }
            ClusterBody::PresenceJoin { channel, member } => {
                handler.on_presence_join(node, app_id, &channel, member);
            }
            ClusterBody::PresenceLeave { channel, user_id } => {
                handler.on_presence_leave(node, app_id, &channel, &user_id);
            }
            ClusterBody::Occupancy { channel, delta } => {
                handler.on_occupancy(node, app_id, &channel, delta);
            }
            ClusterBody::Snapshot { entries } => {
                debug!(node = %node, entries = entries.len(), "Snapshot received");
                handler.on_snapshot(node, entries);
            }
            ClusterBody::SyncRequest { target } => {
                if target.as_deref().map_or(true, |t| t == self.config.node_id) {
                    self.request_snapshot();
                }
            }
            ClusterBody::Heartbeat | ClusterBody::Goodbye => {}
        }
    }

    async fn outbox_loop(self: Arc<Self>, mut outbox: mpsc::UnboundedReceiver<Outgoing>) {
        while let Some(item) = outbox.recv().await {
            let (topic, message) = match item {
                Outgoing::Mirror(message) => (self.app_topic(&message.app_id), message),
                Outgoing::Snapshot(entries) => {
                    debug!(entries = entries.len(), "Publishing snapshot");
                    (
                        self.cluster_topic(),
                        ClusterMessage::new(
                            self.config.node_id.clone(),
                            "",
                            ClusterBody::Snapshot { entries },
                        ),
                    )
                }
            };
            // Failures are logged by publish; a later snapshot repairs the gap
            let _ = self.publish(&topic, &message).await;
        }
    }

    async fn maintenance_loop(self: Arc<Self>, handler: Arc<dyn ClusterHandler>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_resync = Instant::now();

        loop {
            ticker.tick().await;

            let heartbeat = ClusterMessage::new(self.config.node_id.clone(), "", ClusterBody::Heartbeat);
            let _ = self.publish(&self.cluster_topic(), &heartbeat).await;

            for node in self.expire_nodes() {
                warn!(node = %node, "Node timed out");
                handler.on_node_lost(&node);
            }

            if last_resync.elapsed() >= self.config.resync_interval {
                last_resync = Instant::now();
                self.request_snapshot();
            }
        }
    }

    fn expire_nodes(&self) -> Vec<String> {
        let timeout = self.config.node_timeout;
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.value().elapsed() > timeout)
            .map(|n| n.key().clone())
            .collect();
        for node in &expired {
            self.nodes.remove(node);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tenvis_herald_bus::MemoryBus;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }

        fn push(&self, entry: String) {
            self.seen.lock().unwrap().push(entry);
        }
    }

    impl ClusterHandler for Recorder {
        fn on_broadcast(&self, event: Event) {
            self.push(format!("broadcast:{}:{}", event.channel, event.name));
        }

        fn on_presence_join(&self, node: &str, _app_id: &str, channel: &str, member: MemberData) {
            self.push(format!("join:{node}:{channel}:{}", member.user_id));
        }

        fn on_presence_leave(&self, node: &str, _app_id: &str, channel: &str, user_id: &str) {
            self.push(format!("leave:{node}:{channel}:{user_id}"));
        }

        fn on_occupancy(&self, node: &str, _app_id: &str, channel: &str, delta: i64) {
            self.push(format!("occupancy:{node}:{channel}:{delta}"));
        }

        fn on_snapshot(&self, node: &str, entries: Vec<SnapshotEntry>) {
            self.push(format!("snapshot:{node}:{}", entries.len()));
        }

        fn on_node_lost(&self, node: &str) {
            self.push(format!("lost:{node}"));
        }

        fn local_snapshot(&self) -> Vec<SnapshotEntry> {
            Vec::new()
        }
    }

    fn config(node: &str) -> AdapterConfig {
        AdapterConfig {
            node_id: node.to_string(),
            ..Default::default()
        }
    }

    async fn wait_for(recorder: &Recorder, predicate: impl Fn(&[String]) -> bool) {
        for _ in 0..200 {
            if predicate(&recorder.seen()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached, seen: {:?}", recorder.seen());
    }

    #[tokio::test]
    async fn test_broadcast_skips_own_node() {
        let bus = MemoryBus::new();
        let a = HorizontalAdapter::new(Arc::new(bus.transport()), config("a"));
        let b = HorizontalAdapter::new(Arc::new(bus.transport()), config("b"));
        let rec_a = Arc::new(Recorder::default());
        let rec_b = Arc::new(Recorder::default());
        a.start(rec_a.clone()).await.unwrap();
        b.start(rec_b.clone()).await.unwrap();

        let event = Event::new("app-1", "game-1", "score-update", json!({"score": 42}));
        let receivers = a.broadcast(&event).await.unwrap();
        assert_eq!(receivers, 2);

        wait_for(&rec_b, |seen| seen.iter().any(|s| s == "broadcast:game-1:score-update")).await;
        assert!(!rec_a.seen().iter().any(|s| s.starts_with("broadcast")));
    }

    #[tokio::test]
    async fn test_mirrors_keep_order() {
        let bus = MemoryBus::new();
        let a = HorizontalAdapter::new(Arc::new(bus.transport()), config("a"));
        let b = HorizontalAdapter::new(Arc::new(bus.transport()), config("b"));
        let rec_b = Arc::new(Recorder::default());
        a.start(Arc::new(Recorder::default())).await.unwrap();
        b.start(rec_b.clone()).await.unwrap();

        let member = MemberData {
            user_id: "7".into(),
            user_info: None,
        };
        a.enqueue(
            "app-1",
            ClusterBody::PresenceJoin {
                channel: "presence-x".into(),
                member,
            },
        );
        a.enqueue(
            "app-1",
            ClusterBody::PresenceLeave {
                channel: "presence-x".into(),
                user_id: "7".into(),
            },
        );

        wait_for(&rec_b, |seen| seen.iter().any(|s| s.starts_with("leave"))).await;
        let seen = rec_b.seen();
        let join = seen.iter().position(|s| s == "join:a:presence-x:7").unwrap();
        let leave = seen.iter().position(|s| s == "leave:a:presence-x:7").unwrap();
        assert!(join < leave);
    }

    #[tokio::test]
    async fn test_goodbye_and_degraded() {
        let bus = MemoryBus::new();
        let a = HorizontalAdapter::new(Arc::new(bus.transport()), config("a"));
        let b = HorizontalAdapter::new(Arc::new(bus.transport()), config("b"));
        let rec_b = Arc::new(Recorder::default());
        a.start(Arc::new(Recorder::default())).await.unwrap();
        b.start(rec_b.clone()).await.unwrap();

        a.goodbye().await.unwrap();
        wait_for(&rec_b, |seen| seen.iter().any(|s| s == "lost:a")).await;

        bus.set_available(false);
        let event = Event::new("app-1", "game-1", "e", json!(null));
        assert!(a.broadcast(&event).await.is_err());
        assert!(a.is_degraded());

        bus.set_available(true);
        a.broadcast(&event).await.unwrap();
        for _ in 0..200 {
            if !a.is_degraded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!a.is_degraded());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let bus = MemoryBus::new();
        let a = HorizontalAdapter::new(Arc::new(bus.transport()), config("a"));
        a.start(Arc::new(Recorder::default())).await.unwrap();
        assert!(matches!(
            a.start(Arc::new(Recorder::default())).await,
            Err(AdapterError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_topics() {
        let bus = MemoryBus::new();
        let a = HorizontalAdapter::new(Arc::new(bus.transport()), config("a"));
        assert_eq!(a.app_topic("42"), "herald#42");
        assert_eq!(a.cluster_topic(), "herald#~cluster");
        assert_eq!(a.pattern(), "herald#*");
    }
}
