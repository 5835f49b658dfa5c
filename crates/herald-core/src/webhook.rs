//! Webhook notifications.
//!
//! Delivery to the app's endpoint is someone else's job; the core only
//! hands events to a [`WebhookSink`] and never waits for it.

use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;
use tracing::info;

use crate::app::App;

/// Events reported to apps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum WebhookEvent {
    ChannelOccupied {
        channel: String,
    },
    ChannelVacated {
        channel: String,
    },
    MemberAdded {
        channel: String,
        user_id: String,
    },
    MemberRemoved {
        channel: String,
        user_id: String,
    },
    ClientEvent {
        channel: String,
        event: String,
        data: Value,
        socket_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
}

impl WebhookEvent {
    /// Webhook name as sent to apps.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            WebhookEvent::ChannelOccupied { .. } => "channel_occupied",
            WebhookEvent::ChannelVacated { .. } => "channel_vacated",
            WebhookEvent::MemberAdded { .. } => "member_added",
            WebhookEvent::MemberRemoved { .. } => "member_removed",
            WebhookEvent::ClientEvent { .. } => "client_event",
        }
    }

    /// Channel the event concerns.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            WebhookEvent::ChannelOccupied { channel }
            | WebhookEvent::ChannelVacated { channel }
            | WebhookEvent::MemberAdded { channel, .. }
            | WebhookEvent::MemberRemoved { channel, .. }
            | WebhookEvent::ClientEvent { channel, .. } => channel,
        }
    }
}

/// Receiver of webhook events. Implementations must not block.
pub trait WebhookSink: Send + Sync {
    fn notify(&self, app: &App, event: WebhookEvent);
}

/// Sink that only logs.
#[derive(Debug, Default)]
pub struct TracingWebhookSink;

impl WebhookSink for TracingWebhookSink {
    fn notify(&self, app: &App, event: WebhookEvent) {
        info!(app = %app.id, channel = %event.channel(), webhook = event.name(), "Webhook");
    }
}

/// Sink that keeps every event, for tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingWebhookSink {
    events: Mutex<Vec<(String, WebhookEvent)>>,
}

impl RecordingWebhookSink {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, with their app id.
    #[must_use]
    pub fn events(&self) -> Vec<(String, WebhookEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Names of the recorded events, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|(_, e)| e.name()).collect()
    }
}

impl WebhookSink for RecordingWebhookSink {
    fn notify(&self, app: &App, event: WebhookEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((app.id.clone(), event));
        }
    }
}
