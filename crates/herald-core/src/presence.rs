//! Presence tracking for Herald.
//!
//! A member (a `user_id`) can be represented by several sockets on this
//! instance and by any number of connections on other instances. The store
//! keeps, per member, the set of local sockets, a reference count per remote
//! node and the latest metadata. A member exists while the merged count is
//! positive; `member_added` / `member_removed` correspond to the merged
//! count crossing zero.

use dashmap::DashMap;
use herald_protocol::cluster::MemberCount;
use herald_protocol::MemberData;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, trace};

use crate::channel::ChannelKey;

/// Presence errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenceError {
    /// The channel already holds the maximum number of members.
    #[error("Presence channel is full ({0} members)")]
    MemberLimit(usize),
}

/// A member appearing or disappearing, cluster-wide.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceTransition {
    Added(MemberData),
    Removed(String),
}

/// Result of a local join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The member did not exist anywhere in the cluster before.
    pub member_added: bool,
    /// The socket was not already representing the member.
    pub newly_bound: bool,
}

/// Result of a local leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaveOutcome {
    /// The member no longer exists anywhere in the cluster.
    pub member_removed: bool,
    /// The socket was representing the member.
    pub released: bool,
}

#[derive(Debug, Default)]
struct MemberEntry {
    info: Option<Value>,
    local: HashSet<String>,
    remote: HashMap<String, u32>,
}

impl MemberEntry {
    fn total(&self) -> u64 {
        self.local.len() as u64 + self.remote.values().map(|c| u64::from(*c)).sum::<u64>()
    }

    fn data(&self, user_id: &str) -> MemberData {
        MemberData {
            user_id: user_id.to_string(),
            user_info: self.info.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct PresenceChannel {
    members: HashMap<String, MemberEntry>,
}

/// Presence state of every presence channel, sharded by channel.
#[derive(Debug, Default)]
pub struct PresenceStore {
    channels: DashMap<ChannelKey, PresenceChannel>,
}

impl PresenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a local socket to a member.
    ///
    /// The member cap only applies to members that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::MemberLimit`] if the channel is full.
    pub fn join(
        &self,
        key: &ChannelKey,
        member: &MemberData,
        socket_id: &str,
        max_members: usize,
    ) -> Result<JoinOutcome, PresenceError> {
        let mut channel = self.channels.entry(key.clone()).or_default();

        if !channel.members.contains_key(&member.user_id)
            && max_members > 0
            && channel.members.len() >= max_members
        {
            return Err(PresenceError::MemberLimit(max_members));
        }

        let entry = channel.members.entry(member.user_id.clone()).or_default();
        let before = entry.total();
        entry.info = member.user_info.clone();
        let newly_bound = entry.local.insert(socket_id.to_string());

        let outcome = JoinOutcome {
            member_added: before == 0 && entry.total() > 0,
            newly_bound,
        };
        trace!(channel = %key, member = %member.user_id, socket = %socket_id, ?outcome, "Presence join");
        Ok(outcome)
    }

    /// Unbind a local socket from a member.
    pub fn leave(&self, key: &ChannelKey, user_id: &str, socket_id: &str) -> LeaveOutcome {
        let mut outcome = LeaveOutcome::default();
        let mut channel_empty = false;

        if let Some(mut channel) = self.channels.get_mut(key) {
            if let Some(entry) = channel.members.get_mut(user_id) {
                outcome.released = entry.local.remove(socket_id);
                if entry.total() == 0 {
                    channel.members.remove(user_id);
                    outcome.member_removed = outcome.released;
                }
            }
            channel_empty = channel.members.is_empty();
        }

        if channel_empty {
            self.channels.remove_if(key, |_, c| c.members.is_empty());
        }
        trace!(channel = %key, member = %user_id, socket = %socket_id, ?outcome, "Presence leave");
        outcome
    }

    /// Count one more connection of `node` for a member.
    pub fn apply_remote_join(
        &self,
        node: &str,
        key: &ChannelKey,
        member: &MemberData,
    ) -> Option<PresenceTransition> {
        let mut channel = self.channels.entry(key.clone()).or_default();
        let entry = channel.members.entry(member.user_id.clone()).or_default();
        let before = entry.total();
        entry.info = member.user_info.clone();
        *entry.remote.entry(node.to_string()).or_insert(0) += 1;

        (before == 0).then(|| PresenceTransition::Added(entry.data(&member.user_id)))
    }

    /// Count one connection of `node` less for a member. Never goes below zero.
    pub fn apply_remote_leave(
        &self,
        node: &str,
        key: &ChannelKey,
        user_id: &str,
    ) -> Option<PresenceTransition> {
        let mut transition = None;
        let mut channel_empty = false;

        if let Some(mut channel) = self.channels.get_mut(key) {
            if let Some(entry) = channel.members.get_mut(user_id) {
                let before = entry.total();
                if let Some(count) = entry.remote.get_mut(node) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        entry.remote.remove(node);
                    }
                }
                if before > 0 && entry.total() == 0 {
                    channel.members.remove(user_id);
                    transition = Some(PresenceTransition::Removed(user_id.to_string()));
                }
            }
            channel_empty = channel.members.is_empty();
        }

        if channel_empty {
            self.channels.remove_if(key, |_, c| c.members.is_empty());
        }
        transition
    }

    /// Replace everything `node` contributes with `snapshot`.
    ///
    /// Returns the transitions this produced.
    pub fn replace_node(
        &self,
        node: &str,
        snapshot: Vec<(ChannelKey, Vec<MemberCount>)>,
    ) -> Vec<(ChannelKey, PresenceTransition)> {
        let mut incoming: HashMap<ChannelKey, HashMap<String, MemberCount>> = HashMap::new();
        for (key, members) in snapshot {
            let slot = incoming.entry(key).or_default();
            for member in members.into_iter().filter(|m| m.connections > 0) {
                slot.insert(member.member.user_id.clone(), member);
            }
        }

        let mut transitions = Vec::new();
        let mut emptied = Vec::new();

        // Existing channels first; new channels are inserted afterwards so the
        // map is never written while it is being iterated.
        for mut channel in self.channels.iter_mut() {
            let key = channel.key().clone();
            let mut wanted = incoming.remove(&key).unwrap_or_default();
            let members = &mut channel.value_mut().members;

            let mut removed = Vec::new();
            for (user_id, entry) in members.iter_mut() {
                let before = entry.total();
                match wanted.remove(user_id) {
                    Some(update) => {
                        entry.remote.insert(node.to_string(), update.connections);
                        entry.info = update.member.user_info;
                    }
                    None => {
                        entry.remote.remove(node);
                    }
                }
                let after = entry.total();
                if before == 0 && after > 0 {
                    transitions.push((key.clone(), PresenceTransition::Added(entry.data(user_id))));
                } else if before > 0 && after == 0 {
                    removed.push(user_id.clone());
                }
            }
            for user_id in removed {
                members.remove(&user_id);
                transitions.push((key.clone(), PresenceTransition::Removed(user_id)));
            }

            for (user_id, update) in wanted {
                let entry = members.entry(user_id.clone()).or_default();
                entry.info = update.member.user_info.clone();
                entry.remote.insert(node.to_string(), update.connections);
                transitions.push((key.clone(), PresenceTransition::Added(update.member)));
            }

            if members.is_empty() {
                emptied.push(key);
            }
        }

        for (key, wanted) in incoming {
            if wanted.is_empty() {
                continue;
            }
            let mut channel = self.channels.entry(key.clone()).or_default();
            for (user_id, update) in wanted {
                let entry = channel.members.entry(user_id).or_default();
                let before = entry.total();
                entry.info = update.member.user_info.clone();
                entry.remote.insert(node.to_string(), update.connections);
                if before == 0 {
                    transitions.push((key.clone(), PresenceTransition::Added(update.member)));
                }
            }
        }

        for key in emptied {
            self.channels.remove_if(&key, |_, c| c.members.is_empty());
        }

        debug!(node = %node, transitions = transitions.len(), "Presence replaced from snapshot");
        transitions
    }

    /// Forget everything `node` contributes.
    pub fn drop_node(&self, node: &str) -> Vec<(ChannelKey, PresenceTransition)> {
        self.replace_node(node, Vec::new())
    }

    /// Current members of a channel, ordered by user id.
    #[must_use]
    pub fn members(&self, key: &ChannelKey) -> Vec<MemberData> {
        let mut members: Vec<MemberData> = self
            .channels
            .get(key)
            .map(|c| c.members.iter().map(|(id, e)| e.data(id)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    }

    /// Number of members of a channel.
    #[must_use]
    pub fn member_count(&self, key: &ChannelKey) -> usize {
        self.channels.get(key).map(|c| c.members.len()).unwrap_or(0)
    }

    /// Check if a member exists in a channel.
    #[must_use]
    pub fn is_member(&self, key: &ChannelKey, user_id: &str) -> bool {
        self.channels
            .get(key)
            .is_some_and(|c| c.members.contains_key(user_id))
    }

    /// This instance's own contribution, for snapshots.
    #[must_use]
    pub fn local_snapshot(&self) -> Vec<(ChannelKey, Vec<MemberCount>)> {
        self.channels
            .iter()
            .filter_map(|channel| {
                let members: Vec<MemberCount> = channel
                    .members
                    .iter()
                    .filter(|(_, e)| !e.local.is_empty())
                    .map(|(id, e)| MemberCount {
                        member: e.data(id),
                        connections: e.local.len() as u32,
                    })
                    .collect();
                (!members.is_empty()).then(|| (channel.key().clone(), members))
            })
            .collect()
    }
}
