//! Channel abstraction for Herald.
//!
//! Channels are named rooms within an app. The prefix of the name decides
//! the [`ChannelKind`]; only local subscribers are stored here, remote ones
//! are reached through the horizontal adapter.

use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::{Connection, SocketId};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 200;

const PRIVATE_PREFIX: &str = "private-";
const PRESENCE_PREFIX: &str = "presence-";

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-=@,.;".contains(c))
    {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// The closed set of channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    /// `private-` channels, including `private-encrypted-`.
    Private,
    /// `presence-` channels.
    Presence,
}

impl ChannelKind {
    /// Resolve the kind from a channel name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            ChannelKind::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    /// Check if subscribing needs a signature.
    #[must_use]
    pub fn requires_auth(self) -> bool {
        !matches!(self, ChannelKind::Public)
    }

    /// Check if this is a presence channel.
    #[must_use]
    pub fn is_presence(self) -> bool {
        matches!(self, ChannelKind::Presence)
    }

    /// Lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
            ChannelKind::Presence => "presence",
        }
    }
}

/// A channel of a specific app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub app_id: String,
    pub channel: String,
}

impl ChannelKey {
    /// Create a key.
    #[must_use]
    pub fn new(app_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.channel)
    }
}

/// Local subscribers of one channel.
#[derive(Debug)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
    subscribers: HashMap<SocketId, Arc<Connection>>,
}

impl Channel {
    /// Create an empty channel.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: ChannelKind::from_name(&name),
            name,
            subscribers: HashMap::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the channel kind.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Add a subscriber. Returns `false` if it was already present.
    pub fn insert(&mut self, connection: Arc<Connection>) -> bool {
        let socket_id = connection.socket_id().to_string();
        if self.subscribers.contains_key(&socket_id) {
            return false;
        }
        self.subscribers.insert(socket_id, connection);
        true
    }

    /// Remove a subscriber. Returns `true` if it was present.
    pub fn remove(&mut self, socket_id: &str) -> bool {
        self.subscribers.remove(socket_id).is_some()
    }

    /// Check if a socket is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, socket_id: &str) -> bool {
        self.subscribers.contains_key(socket_id)
    }

    /// Get the number of local subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if the channel has no local subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Iterate over local subscribers.
    pub fn subscribers(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.subscribers.values()
    }
}

/// All locally populated channels, shared by the channel manager (writer)
/// and the broadcaster (reader).
pub type ChannelIndex = Arc<DashMap<ChannelKey, Channel>>;

/// Create an empty channel index.
#[must_use]
pub fn new_index() -> ChannelIndex {
    Arc::new(DashMap::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("game-1").is_ok());
        assert!(validate_channel_name("private-orders_2024=@,.;").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("has space").is_err());
        assert!(validate_channel_name("emoji-🎉").is_err());
        assert!(validate_channel_name("#hash").is_err());

        let max = "a".repeat(MAX_CHANNEL_NAME_LENGTH);
        assert!(validate_channel_name(&max).is_ok());
        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_channel_kinds() {
        assert_eq!(ChannelKind::from_name("game-1"), ChannelKind::Public);
        assert_eq!(ChannelKind::from_name("private-orders"), ChannelKind::Private);
        assert_eq!(
            ChannelKind::from_name("private-encrypted-vault"),
            ChannelKind::Private
        );
        assert_eq!(ChannelKind::from_name("presence-lobby"), ChannelKind::Presence);
        assert!(!ChannelKind::Public.requires_auth());
        assert!(ChannelKind::Presence.requires_auth());
        assert!(ChannelKind::Presence.is_presence());
    }

    #[test]
    fn test_channel_subscribe_unsubscribe() {
        let app = Arc::new(App::new("1", "key", "secret"));
        let (c1, _rx1) = Connection::new(app.clone(), 4);
        let (c2, _rx2) = Connection::new(app, 4);

        let mut channel = Channel::new("test");
        assert!(channel.insert(c1.clone()));
        assert!(!channel.insert(c1.clone()));
        assert!(channel.insert(c2.clone()));
        assert_eq!(channel.subscriber_count(), 2);

        assert!(channel.remove(c1.socket_id()));
        assert!(!channel.remove(c1.socket_id()));
        assert!(!channel.is_subscribed(c1.socket_id()));
        assert!(channel.is_subscribed(c2.socket_id()));
        assert!(!channel.is_empty());
    }
}
