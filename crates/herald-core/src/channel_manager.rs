//! Channel subscription state machine.
//!
//! The channel manager owns the local channel index, drives the presence
//! store and keeps a view of how many subscribers other instances have.
//! Every change to a channel happens under that channel's shard lock, in
//! the order mirror section, channel index, presence store. Cluster mirrors
//! are enqueued under the same locks so their order matches the state
//! changes and no snapshot falls between a change and its mirror.

use dashmap::DashMap;
use herald_protocol::cluster::{MemberCount, SnapshotEntry};
use herald_protocol::{ClusterBody, MemberData, SubscribeRequest};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::adapter::HorizontalAdapter;
use crate::auth;
use crate::broadcaster::Broadcaster;
use crate::channel::{validate_channel_name, Channel, ChannelIndex, ChannelKey, ChannelKind};
use crate::connection::Connection;
use crate::presence::{PresenceError, PresenceStore, PresenceTransition};
use crate::webhook::{WebhookEvent, WebhookSink};

/// Subscription errors, reported to the client as `pusher:subscription_error`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The app does not allow presence channels.
    #[error("Presence channels are disabled for this app")]
    PresenceDisabled,

    /// Missing or invalid signature.
    #[error("Invalid signature")]
    Unauthorized,

    /// `channel_data` is missing or malformed.
    #[error("Invalid channel_data: {0}")]
    InvalidChannelData(String),

    /// `channel_data` exceeds the app's member size limit.
    #[error("channel_data exceeds {0} bytes")]
    MemberTooLarge(usize),

    /// The presence channel is full.
    #[error("Presence channel is full ({0} members)")]
    MemberLimit(usize),

    /// The connection is being torn down.
    #[error("Connection is closing")]
    ConnectionClosed,
}

impl SubscribeError {
    /// `type` field of the subscription error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SubscribeError::InvalidChannel(_) => "InvalidChannel",
            SubscribeError::PresenceDisabled => "PresenceDisabled",
            SubscribeError::Unauthorized => "AuthError",
            SubscribeError::InvalidChannelData(_) => "InvalidChannelData",
            SubscribeError::MemberTooLarge(_) | SubscribeError::MemberLimit(_) => "LimitReached",
            SubscribeError::ConnectionClosed => "ConnectionClosed",
        }
    }

    /// HTTP-like `status` field of the subscription error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            SubscribeError::InvalidChannel(_) | SubscribeError::InvalidChannelData(_) => 400,
            SubscribeError::Unauthorized => 401,
            SubscribeError::PresenceDisabled | SubscribeError::MemberLimit(_) => 403,
            SubscribeError::MemberTooLarge(_) => 413,
            SubscribeError::ConnectionClosed => 410,
        }
    }
}

impl From<PresenceError> for SubscribeError {
    fn from(e: PresenceError) -> Self {
        match e {
            PresenceError::MemberLimit(max) => SubscribeError::MemberLimit(max),
        }
    }
}

/// A successful subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionResult {
    pub channel: String,
    pub kind: ChannelKind,
    /// `false` when the connection was already subscribed.
    pub newly_subscribed: bool,
    /// Current members, presence channels only.
    pub members: Option<Vec<MemberData>>,
}

/// Result of an unsubscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    /// The connection was subscribed.
    pub removed: bool,
    /// The channel has no local subscribers left.
    pub vacated: bool,
    /// The member that left the cluster, if any.
    pub member_removed: Option<String>,
}

/// Information about a channel for the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub kind: ChannelKind,
    /// Subscribers across the cluster.
    pub subscription_count: u64,
    /// Subscribers on this instance.
    pub local_subscriptions: u64,
    pub occupied: bool,
    /// Distinct members, presence channels only.
    pub user_count: Option<usize>,
}

/// Subscription state machine.
pub struct ChannelManager {
    index: ChannelIndex,
    presence: Arc<PresenceStore>,
    broadcaster: Arc<Broadcaster>,
    adapter: Arc<HorizontalAdapter>,
    webhooks: Arc<dyn WebhookSink>,
    /// Channel -> remote node -> subscriber count on that node.
    remote: DashMap<ChannelKey, HashMap<String, u64>>,
}

impl ChannelManager {
    /// Create a channel manager.
    #[must_use]
    pub fn new(
        index: ChannelIndex,
        presence: Arc<PresenceStore>,
        broadcaster: Arc<Broadcaster>,
        adapter: Arc<HorizontalAdapter>,
        webhooks: Arc<dyn WebhookSink>,
    ) -> Self {
        Self {
            index,
            presence,
            broadcaster,
            adapter,
            webhooks,
            remote: DashMap::new(),
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// Subscribing again to the same channel succeeds without changing any
    /// state.
    ///
    /// # Errors
    ///
    /// Returns an error, with no state change, if the name is invalid, the
    /// signature does not verify, a presence limit is hit or the connection
    /// is already being torn down.
    pub fn subscribe(
        &self,
        connection: &Arc<Connection>,
        request: &SubscribeRequest,
    ) -> Result<SubscriptionResult, SubscribeError> {
        let channel = request.channel.as_str();
        validate_channel_name(channel).map_err(SubscribeError::InvalidChannel)?;

        let app = connection.app();
        let socket_id = connection.socket_id();
        let kind = ChannelKind::from_name(channel);

        if kind.is_presence() && !app.presence_enabled {
            return Err(SubscribeError::PresenceDisabled);
        }

        let channel_data = if kind.is_presence() {
            request.channel_data.as_deref()
        } else {
            None
        };

        if kind.requires_auth() {
            let provided = request.auth.as_deref().ok_or(SubscribeError::Unauthorized)?;
            if !auth::verify(app, channel, socket_id, provided, channel_data) {
                debug!(app = %app.id, channel = %channel, socket = %socket_id, "Signature rejected");
                return Err(SubscribeError::Unauthorized);
            }
        }

        let member = match kind {
            ChannelKind::Presence => Some(parse_member(channel_data, app.max_presence_member_bytes)?),
            _ => None,
        };

        let key = ChannelKey::new(app.id.clone(), channel);

        let (members, occupied, member_added) = {
            let _mirrors = self.adapter.mirror_section();
            let mut entry = self
                .index
                .entry(key.clone())
                .or_insert_with(|| Channel::new(channel));

            if entry.is_subscribed(socket_id) {
                trace!(channel = %key, socket = %socket_id, "Already subscribed");
                let members = kind.is_presence().then(|| self.presence.members(&key));
                return Ok(SubscriptionResult {
                    channel: channel.to_string(),
                    kind,
                    newly_subscribed: false,
                    members,
                });
            }

            // Fails once teardown sealed the connection's subscriptions
            if !connection.add_channel(channel, member.as_ref().map(|m| m.user_id.clone())) {
                drop(entry);
                self.index.remove_if(&key, |_, c| c.is_empty());
                debug!(channel = %key, socket = %socket_id, "Connection closing, subscription refused");
                return Err(SubscribeError::ConnectionClosed);
            }

            let mut member_added = false;
            if let Some(member) = &member {
                let joined = match self.presence.join(&key, member, socket_id, app.max_presence_members) {
                    Ok(joined) => joined,
                    Err(e) => {
                        connection.remove_channel(channel);
                        drop(entry);
                        self.index.remove_if(&key, |_, c| c.is_empty());
                        return Err(e.into());
                    }
                };
                member_added = joined.member_added;
                if joined.newly_bound {
                    self.adapter.enqueue(
                        &app.id,
                        ClusterBody::PresenceJoin {
                            channel: channel.to_string(),
                            member: member.clone(),
                        },
                    );
                }
            }

            entry.insert(Arc::clone(connection));
            let occupied = entry.subscriber_count() == 1;
            self.adapter.enqueue(
                &app.id,
                ClusterBody::Occupancy {
                    channel: channel.to_string(),
                    delta: 1,
                },
            );

            let members = kind.is_presence().then(|| self.presence.members(&key));
            (members, occupied, member_added)
        };

        if kind.requires_auth() {
            connection.mark_authenticated();
        }
        debug!(app = %app.id, channel = %channel, socket = %socket_id, kind = kind.as_str(), "Subscribed");

        if occupied {
            self.webhooks.notify(
                app,
                WebhookEvent::ChannelOccupied {
                    channel: channel.to_string(),
                },
            );
        }
        if let (true, Some(member)) = (member_added, &member) {
            self.webhooks.notify(
                app,
                WebhookEvent::MemberAdded {
                    channel: channel.to_string(),
                    user_id: member.user_id.clone(),
                },
            );
            self.broadcaster
                .announce_member_added(&key, member, Some(socket_id));
        }

        Ok(SubscriptionResult {
            channel: channel.to_string(),
            kind,
            newly_subscribed: true,
            members,
        })
    }

    /// Unsubscribe a connection from a channel. Unknown subscriptions are a
    /// no-op.
    pub fn unsubscribe(&self, connection: &Arc<Connection>, channel: &str) -> UnsubscribeOutcome {
        let Some(member_id) = connection.remove_channel(channel) else {
            return UnsubscribeOutcome::default();
        };

        let app = connection.app();
        let socket_id = connection.socket_id();
        let key = ChannelKey::new(app.id.clone(), channel);
        let mut outcome = UnsubscribeOutcome::default();

        let mirrors = self.adapter.mirror_section();
        if let Some(mut entry) = self.index.get_mut(&key) {
            if entry.remove(socket_id) {
                outcome.removed = true;
                if let Some(user_id) = &member_id {
                    let left = self.presence.leave(&key, user_id, socket_id);
                    if left.released {
                        self.adapter.enqueue(
                            &app.id,
                            ClusterBody::PresenceLeave {
                                channel: channel.to_string(),
                                user_id: user_id.clone(),
                            },
                        );
                    }
                    if left.member_removed {
                        outcome.member_removed = Some(user_id.clone());
                    }
                }
                self.adapter.enqueue(
                    &app.id,
                    ClusterBody::Occupancy {
                        channel: channel.to_string(),
                        delta: -1,
                    },
                );
                outcome.vacated = entry.is_empty();
            }
        }
        drop(mirrors);

        if let Some(user_id) = &outcome.member_removed {
            self.webhooks.notify(
                app,
                WebhookEvent::MemberRemoved {
                    channel: channel.to_string(),
                    user_id: user_id.clone(),
                },
            );
            self.broadcaster.announce_member_removed(&key, user_id);
        }
        if outcome.vacated {
            self.index.remove_if(&key, |_, c| c.is_empty());
            self.webhooks.notify(
                app,
                WebhookEvent::ChannelVacated {
                    channel: channel.to_string(),
                },
            );
        }

        debug!(app = %app.id, channel = %channel, socket = %socket_id, "Unsubscribed");
        outcome
    }

    /// Unsubscribe a connection from every channel and refuse any later
    /// subscription, so a subscribe racing the teardown cannot leave the
    /// connection behind in a channel.
    pub fn unsubscribe_all(&self, connection: &Arc<Connection>) {
        for channel in connection.seal_channels() {
            self.unsubscribe(connection, &channel);
        }
        debug!(socket = %connection.socket_id(), "Unsubscribed from all channels");
    }

    /// Number of local subscribers of a channel.
    #[must_use]
    pub fn local_subscriptions(&self, key: &ChannelKey) -> u64 {
        self.index
            .get(key)
            .map(|c| c.subscriber_count() as u64)
            .unwrap_or(0)
    }

    fn remote_subscriptions(&self, key: &ChannelKey) -> u64 {
        self.remote
            .get(key)
            .map(|nodes| nodes.values().sum())
            .unwrap_or(0)
    }

    /// Describe one channel.
    #[must_use]
    pub fn channel_info(&self, app_id: &str, channel: &str) -> ChannelInfo {
        let key = ChannelKey::new(app_id, channel);
        let kind = ChannelKind::from_name(channel);
        let local = self.local_subscriptions(&key);
        let total = local + self.remote_subscriptions(&key);
        ChannelInfo {
            name: channel.to_string(),
            kind,
            subscription_count: total,
            local_subscriptions: local,
            occupied: total > 0,
            user_count: kind
                .is_presence()
                .then(|| self.presence.member_count(&key)),
        }
    }

    /// Occupied channels of an app, local or remote, sorted by name.
    #[must_use]
    pub fn channels(&self, app_id: &str, prefix: Option<&str>) -> Vec<ChannelInfo> {
        let wanted = |key: &ChannelKey| {
            key.app_id == app_id && prefix.map_or(true, |p| key.channel.starts_with(p))
        };

        let mut names: Vec<String> = self
            .index
            .iter()
            .filter(|c| wanted(c.key()))
            .map(|c| c.key().channel.clone())
            .collect();
        names.extend(
            self.remote
                .iter()
                .filter(|c| wanted(c.key()))
                .map(|c| c.key().channel.clone()),
        );
        names.sort();
        names.dedup();

        names
            .into_iter()
            .map(|name| self.channel_info(app_id, &name))
            .filter(|info| info.occupied)
            .collect()
    }

    /// Current members of a presence channel.
    #[must_use]
    pub fn members(&self, app_id: &str, channel: &str) -> Vec<MemberData> {
        self.presence.members(&ChannelKey::new(app_id, channel))
    }

    /// Apply another node's subscriber count change.
    pub fn apply_remote_occupancy(&self, node: &str, key: ChannelKey, delta: i64) {
        let empty = {
            let mut nodes = self.remote.entry(key.clone()).or_default();
            let count = nodes.entry(node.to_string()).or_insert(0);
            *count = if delta < 0 {
                count.saturating_sub(delta.unsigned_abs())
            } else {
                count.saturating_add(delta.unsigned_abs())
            };
            if *count == 0 {
                nodes.remove(node);
            }
            nodes.is_empty()
        };
        if empty {
            self.remote.remove_if(&key, |_, nodes| nodes.is_empty());
        }
    }

    /// Apply another node's presence join, announcing a new member locally.
    pub fn apply_remote_join(&self, node: &str, key: &ChannelKey, member: &MemberData) {
        if let Some(transition) = self.presence.apply_remote_join(node, key, member) {
            self.announce(key, transition);
        }
    }

    /// Apply another node's presence leave, announcing a departed member
    /// locally.
    pub fn apply_remote_leave(&self, node: &str, key: &ChannelKey, user_id: &str) {
        if let Some(transition) = self.presence.apply_remote_leave(node, key, user_id) {
            self.announce(key, transition);
        }
    }

    /// Replace everything a node contributes with its snapshot.
    pub fn apply_snapshot(&self, node: &str, entries: Vec<SnapshotEntry>) {
        let mut occupancy = Vec::with_capacity(entries.len());
        let mut presence = Vec::new();
        for entry in entries {
            let key = ChannelKey::new(entry.app_id, entry.channel);
            if !entry.members.is_empty() {
                presence.push((key.clone(), entry.members));
            }
            occupancy.push((key, entry.subscribers));
        }

        self.replace_remote_occupancy(node, occupancy);
        for (key, transition) in self.presence.replace_node(node, presence) {
            self.announce(&key, transition);
        }
    }

    /// Forget a node that left or timed out.
    pub fn drop_node(&self, node: &str) {
        self.replace_remote_occupancy(node, Vec::new());
        let transitions = self.presence.drop_node(node);
        info!(node = %node, removed_members = transitions.len(), "Dropped node state");
        for (key, transition) in transitions {
            self.announce(&key, transition);
        }
    }

    fn replace_remote_occupancy(&self, node: &str, counts: Vec<(ChannelKey, u64)>) {
        let mut emptied = Vec::new();
        for mut entry in self.remote.iter_mut() {
            entry.value_mut().remove(node);
            if entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for key in emptied {
            self.remote.remove_if(&key, |_, nodes| nodes.is_empty());
        }
        for (key, count) in counts.into_iter().filter(|(_, c)| *c > 0) {
            self.remote
                .entry(key)
                .or_default()
                .insert(node.to_string(), count);
        }
    }

    fn announce(&self, key: &ChannelKey, transition: PresenceTransition) {
        match transition {
            PresenceTransition::Added(member) => {
                self.broadcaster.announce_member_added(key, &member, None);
            }
            PresenceTransition::Removed(user_id) => {
                self.broadcaster.announce_member_removed(key, &user_id);
            }
        }
    }

    /// This instance's subscriber counts and presence members.
    #[must_use]
    pub fn local_snapshot(&self) -> Vec<SnapshotEntry> {
        let mut members: HashMap<ChannelKey, Vec<MemberCount>> =
            self.presence.local_snapshot().into_iter().collect();

        let mut entries: Vec<SnapshotEntry> = self
            .index
            .iter()
            .map(|channel| SnapshotEntry {
                app_id: channel.key().app_id.clone(),
                channel: channel.key().channel.clone(),
                subscribers: channel.subscriber_count() as u64,
                members: members.remove(channel.key()).unwrap_or_default(),
            })
            .collect();
        entries.extend(members.into_iter().map(|(key, members)| SnapshotEntry {
            app_id: key.app_id,
            channel: key.channel,
            subscribers: 0,
            members,
        }));
        entries
    }
}

/// Parse presence `channel_data`: `{"user_id": string|number, "user_info"?: any}`.
fn parse_member(channel_data: Option<&str>, max_bytes: usize) -> Result<MemberData, SubscribeError> {
    let raw = channel_data
        .ok_or_else(|| SubscribeError::InvalidChannelData("channel_data is required".into()))?;
    if max_bytes > 0 && raw.len() > max_bytes {
        return Err(SubscribeError::MemberTooLarge(max_bytes));
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|e| SubscribeError::InvalidChannelData(e.to_string()))?;
    let user_id = match value.get("user_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(SubscribeError::InvalidChannelData("user_id is required".into())),
    };
    let user_info = value.get("user_info").filter(|v| !v.is_null()).cloned();

    Ok(MemberData { user_id, user_info })
}
