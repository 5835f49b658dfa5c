//! Messages exchanged between Herald instances over the horizontal bus.
//!
//! These never reach clients. They are encoded with MessagePack, which keeps
//! them compact on the bus while still carrying arbitrary JSON payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::frames::MemberData;

/// A message published by one instance for all others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Instance that produced the message.
    pub node_id: String,
    /// App the message belongs to (empty for control traffic).
    #[serde(default)]
    pub app_id: String,
    /// Message contents.
    pub body: ClusterBody,
}

/// Cluster message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterBody {
    /// An event to deliver to local subscribers of a channel.
    Broadcast {
        channel: String,
        event: String,
        data: Value,
        #[serde(default)]
        except: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    /// One more connection of the origin node represents this member.
    PresenceJoin { channel: String, member: MemberData },
    /// One connection of the origin node stopped representing this member.
    PresenceLeave { channel: String, user_id: String },
    /// The origin node's subscriber count for a channel changed by `delta`.
    Occupancy { channel: String, delta: i64 },
    /// Full replacement of the origin node's presence and occupancy state.
    Snapshot { entries: Vec<SnapshotEntry> },
    /// Liveness beacon.
    Heartbeat,
    /// Ask `target` (or every node) to publish a snapshot.
    SyncRequest {
        #[serde(default)]
        target: Option<String>,
    },
    /// The origin node is shutting down.
    Goodbye,
}

/// One channel's worth of a node snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub app_id: String,
    pub channel: String,
    /// Local subscriber count on the origin node.
    pub subscribers: u64,
    /// Presence members and how many local connections represent each.
    #[serde(default)]
    pub members: Vec<MemberCount>,
}

/// A presence member with its connection count on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberCount {
    pub member: MemberData,
    pub connections: u32,
}

impl ClusterMessage {
    /// Create a message.
    #[must_use]
    pub fn new(node_id: impl Into<String>, app_id: impl Into<String>, body: ClusterBody) -> Self {
        Self {
            node_id: node_id.into(),
            app_id: app_id.into(),
            body,
        }
    }

    /// Short label for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.body {
            ClusterBody::Broadcast { .. } => "broadcast",
            ClusterBody::PresenceJoin { .. } => "presence_join",
            ClusterBody::PresenceLeave { .. } => "presence_leave",
            ClusterBody::Occupancy { .. } => "occupancy",
            ClusterBody::Snapshot { .. } => "snapshot",
            ClusterBody::Heartbeat => "heartbeat",
            ClusterBody::SyncRequest { .. } => "sync_request",
            ClusterBody::Goodbye => "goodbye",
        }
    }
}

/// Encode a cluster message.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode(message: &ClusterMessage) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decode a cluster message.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid cluster message.
pub fn decode(data: &[u8]) -> Result<ClusterMessage, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}
