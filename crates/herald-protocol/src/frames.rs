//! Frame types for the Pusher channels protocol.
//!
//! Every WebSocket text message is one JSON frame of the form
//! `{"event": ..., "channel": ..., "data": ...}`. Server-originated
//! `pusher:*` frames carry their `data` as a JSON-encoded string, which is
//! what the reference client libraries expect.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::codec::ProtocolError;

/// Well-known event names.
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const MEMBER_REMOVED: &str = "pusher_internal:member_removed";

    /// Prefix of events clients may send to each other.
    pub const CLIENT_PREFIX: &str = "client-";
    /// Prefix reserved for protocol events.
    pub const PROTOCOL_PREFIX: &str = "pusher:";
    /// Prefix reserved for server-internal events.
    pub const INTERNAL_PREFIX: &str = "pusher_internal:";
}

/// A protocol frame as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name.
    pub event: String,
    /// Channel the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Sender of a client event on a presence channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A presence member as exposed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberData {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

impl Frame {
    /// Create a frame with just an event name.
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data: None,
            user_id: None,
        }
    }

    /// Attach a channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the originating user of a client event.
    #[must_use]
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// `pusher:connection_established` sent right after the handshake.
    #[must_use]
    pub fn connection_established(socket_id: &str, activity_timeout_secs: u64) -> Self {
        Self::new(events::CONNECTION_ESTABLISHED).with_data(encoded(&json!({
            "socket_id": socket_id,
            "activity_timeout": activity_timeout_secs,
        })))
    }

    /// `pusher_internal:subscription_succeeded` for a public or private channel.
    #[must_use]
    pub fn subscription_succeeded(channel: impl Into<String>) -> Self {
        Self::new(events::SUBSCRIPTION_SUCCEEDED)
            .with_channel(channel)
            .with_data(Value::String("{}".to_string()))
    }

    /// `pusher_internal:subscription_succeeded` for a presence channel,
    /// carrying the current member list.
    #[must_use]
    pub fn presence_subscription_succeeded(
        channel: impl Into<String>,
        members: &[MemberData],
    ) -> Self {
        let ids: Vec<&str> = members.iter().map(|m| m.user_id.as_str()).collect();
        let hash: serde_json::Map<String, Value> = members
            .iter()
            .map(|m| {
                (
                    m.user_id.clone(),
                    m.user_info.clone().unwrap_or(Value::Null),
                )
            })
            .collect();

        Self::new(events::SUBSCRIPTION_SUCCEEDED)
            .with_channel(channel)
            .with_data(encoded(&json!({
                "presence": {
                    "ids": ids,
                    "hash": hash,
                    "count": members.len(),
                }
            })))
    }

    /// `pusher:subscription_error`.
    #[must_use]
    pub fn subscription_error(
        channel: impl Into<String>,
        kind: &str,
        error: impl Into<String>,
        status: u16,
    ) -> Self {
        Self::new(events::SUBSCRIPTION_ERROR)
            .with_channel(channel)
            .with_data(json!({
                "type": kind,
                "error": error.into(),
                "status": status,
            }))
    }

    /// `pusher_internal:member_added`.
    #[must_use]
    pub fn member_added(channel: impl Into<String>, member: &MemberData) -> Self {
        Self::new(events::MEMBER_ADDED)
            .with_channel(channel)
            .with_data(encoded(&json!(member)))
    }

    /// `pusher_internal:member_removed`.
    #[must_use]
    pub fn member_removed(channel: impl Into<String>, user_id: &str) -> Self {
        Self::new(events::MEMBER_REMOVED)
            .with_channel(channel)
            .with_data(encoded(&json!({ "user_id": user_id })))
    }

    /// `pusher:error`.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::new(events::ERROR).with_data(json!({
            "message": message.into(),
            "code": code,
        }))
    }

    /// `pusher:ping`.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(events::PING).with_data(Value::String("{}".to_string()))
    }

    /// `pusher:pong`.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(events::PONG).with_data(Value::String("{}".to_string()))
    }

    /// An application event delivered to subscribers.
    #[must_use]
    pub fn channel_event(event: impl Into<String>, channel: impl Into<String>, data: Value) -> Self {
        Self::new(event).with_channel(channel).with_data(data)
    }
}

/// Serialize a value into a JSON string value, the way `pusher:*` data is sent.
fn encoded(value: &Value) -> Value {
    Value::String(value.to_string())
}

/// A subscription request sent by a client.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscribeRequest {
    /// Channel to join.
    pub channel: String,
    /// `key:signature` proof for private and presence channels.
    pub auth: Option<String>,
    /// JSON-encoded presence member, presence channels only.
    pub channel_data: Option<String>,
}

/// A decoded client-to-server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe { channel: String },
    Ping,
    Pong,
    /// A `client-*` event to be relayed to other subscribers.
    ClientEvent {
        event: String,
        channel: String,
        data: Value,
    },
}

impl ClientMessage {
    /// Interpret a raw frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownEvent`] for events a client may not
    /// send and [`ProtocolError::Invalid`] when required fields are missing.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        match frame.event.as_str() {
            events::PING => Ok(ClientMessage::Ping),
            events::PONG => Ok(ClientMessage::Pong),
            events::SUBSCRIBE => {
                let data = object_data(frame.data)?;
                Ok(ClientMessage::Subscribe(SubscribeRequest {
                    channel: required_str(&data, "channel")?,
                    auth: optional_str(&data, "auth"),
                    channel_data: optional_str(&data, "channel_data"),
                }))
            }
            events::UNSUBSCRIBE => {
                let data = object_data(frame.data)?;
                Ok(ClientMessage::Unsubscribe {
                    channel: required_str(&data, "channel")?,
                })
            }
            name if name.starts_with(events::CLIENT_PREFIX) => {
                let channel = frame
                    .channel
                    .ok_or_else(|| ProtocolError::Invalid("client event without channel".into()))?;
                Ok(ClientMessage::ClientEvent {
                    event: frame.event,
                    channel,
                    data: frame.data.unwrap_or(Value::Null),
                })
            }
            _ => Err(ProtocolError::UnknownEvent(frame.event)),
        }
    }
}

/// Older clients send `data` as a JSON string; newer ones as an object.
fn object_data(data: Option<Value>) -> Result<serde_json::Map<String, Value>, ProtocolError> {
    let value = match data {
        Some(Value::String(raw)) => serde_json::from_str(&raw)?,
        Some(other) => other,
        None => return Err(ProtocolError::Invalid("missing data".into())),
    };

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::Invalid("data must be an object".into())),
    }
}

fn required_str(
    data: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, ProtocolError> {
    optional_str(data, field).ok_or_else(|| ProtocolError::Invalid(format!("missing {field}")))
}

fn optional_str(data: &serde_json::Map<String, Value>, field: &str) -> Option<String> {
    data.get(field).and_then(Value::as_str).map(str::to_string)
}
