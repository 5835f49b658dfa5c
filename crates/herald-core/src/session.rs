//! Per-connection frame handling.
//!
//! A [`Session`] interprets the text frames of one socket. The server's
//! read loop feeds it every frame; anything the session answers is queued
//! on the connection, so the write side stays with the server.

use herald_protocol::{codec, ClientMessage, CloseCode, Frame, ProtocolError, SubscribeRequest};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::channel::ChannelKind;
use crate::channel_manager::SubscribeError;
use crate::connection::{Connection, RateDecision, SendError};
use crate::engine::{payload_size, Engine};
use crate::message::{now_millis, Event};
use crate::webhook::WebhookEvent;

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client sent something that is not a valid frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection was closed.
    #[error("Connection closed ({})", .0.code())]
    Closed(CloseCode),
}

impl SessionError {
    /// Close code to end the socket with.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            SessionError::Protocol(_) => CloseCode::ProtocolViolation,
            SessionError::Closed(code) => *code,
        }
    }
}

/// Reasons a client event is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientEventError {
    #[error("Client events are not enabled for this app")]
    Disabled,

    #[error("Client events are only allowed on private and presence channels")]
    NotPrivate,

    #[error("Not subscribed to {0}")]
    NotSubscribed(String),

    #[error("Payload exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Client event rate limit reached")]
    RateLimited,

    #[error("Client event rate limit exceeded")]
    RateExceeded,
}

impl ClientEventError {
    /// Code of the `pusher:error` answering the event.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ClientEventError::RateLimited | ClientEventError::RateExceeded => {
                CloseCode::RateLimited.code()
            }
            _ => CloseCode::Unauthorized.code(),
        }
    }
}

/// What a handled frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The connection joined a channel it was not subscribed to.
    Subscribed,
    /// A subscription was answered with `pusher:subscription_error`.
    SubscriptionRefused,
    Unsubscribed,
    /// A client event was relayed or answered with an error.
    ClientEvent,
    /// Keepalive traffic and repeated subscriptions.
    Control,
}

/// Frame handler of one connection.
pub struct Session {
    connection: Arc<Connection>,
    engine: Arc<Engine>,
}

impl Session {
    #[must_use]
    pub fn new(connection: Arc<Connection>, engine: Arc<Engine>) -> Self {
        Self { connection, engine }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Handle one text frame from the client.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket must be closed: the frame is
    /// malformed, the connection is already closed, or the client
    /// exceeded its client event rate.
    pub async fn handle_text(&self, text: &str) -> Result<Handled, SessionError> {
        if let Some(code) = self.connection.close_code() {
            return Err(SessionError::Closed(code));
        }
        self.connection.touch(now_millis());

        let message = codec::decode_client(text).map_err(|e| {
            debug!(socket = %self.connection.socket_id(), error = %e, "Malformed frame");
            e
        })?;

        match message {
            ClientMessage::Ping => self.reply(&Frame::pong()).map(|()| Handled::Control),
            ClientMessage::Pong => {
                trace!(socket = %self.connection.socket_id(), "Pong");
                Ok(Handled::Control)
            }
            ClientMessage::Subscribe(request) => self.subscribe(&request),
            ClientMessage::Unsubscribe { channel } => {
                self.engine.channels().unsubscribe(&self.connection, &channel);
                Ok(Handled::Unsubscribed)
            }
            ClientMessage::ClientEvent {
                event,
                channel,
                data,
            } => self
                .client_event(event, channel, data)
                .await
                .map(|()| Handled::ClientEvent),
        }
    }

    /// Release everything the connection holds.
    pub fn close(&self, code: CloseCode) {
        self.engine
            .connections()
            .disconnect(self.connection.socket_id(), code);
    }

    fn subscribe(&self, request: &SubscribeRequest) -> Result<Handled, SessionError> {
        let (frame, handled) = match self.engine.channels().subscribe(&self.connection, request) {
            Ok(result) => {
                let handled = if result.newly_subscribed {
                    Handled::Subscribed
                } else {
                    Handled::Control
                };
                let frame = match result.members {
                    Some(members) => Frame::presence_subscription_succeeded(result.channel, &members),
                    None => Frame::subscription_succeeded(result.channel),
                };
                (frame, handled)
            }
            Err(SubscribeError::ConnectionClosed) => {
                return Err(SessionError::Closed(
                    self.connection.close_code().unwrap_or(CloseCode::Normal),
                ));
            }
            Err(e) => {
                debug!(
                    app = %self.connection.app().id,
                    channel = %request.channel,
                    socket = %self.connection.socket_id(),
                    error = %e,
                    "Subscription refused"
                );
                let frame =
                    Frame::subscription_error(request.channel.clone(), e.kind(), e.to_string(), e.status());
                (frame, Handled::SubscriptionRefused)
            }
        };
        self.reply(&frame).map(|()| handled)
    }

    async fn client_event(&self, event: String, channel: String, data: Value) -> Result<(), SessionError> {
        let user_id = match self.admit_client_event(&channel, &data) {
            Ok(user_id) => user_id,
            Err(ClientEventError::RateExceeded) => {
                warn!(app = %self.connection.app().id, socket = %self.connection.socket_id(), "Client event rate exceeded, closing");
                self.close(CloseCode::RateLimited);
                return Err(SessionError::Closed(CloseCode::RateLimited));
            }
            Err(e) => {
                debug!(channel = %channel, socket = %self.connection.socket_id(), error = %e, "Client event refused");
                return self.reply(&Frame::error(e.code(), e.to_string()));
            }
        };

        let app = self.connection.app();
        let socket_id = self.connection.socket_id().to_string();
        self.engine.webhooks().notify(
            app,
            WebhookEvent::ClientEvent {
                channel: channel.clone(),
                event: event.clone(),
                data: data.clone(),
                socket_id: socket_id.clone(),
                user_id: user_id.clone(),
            },
        );

        let published = Event::new(app.id.clone(), channel, event, data)
            .excluding(Some(socket_id))
            .with_user_id(user_id);
        self.engine.broadcaster().publish(published).await;
        Ok(())
    }

    /// Check a client event, returning the sender's user id on presence
    /// channels.
    fn admit_client_event(&self, channel: &str, data: &Value) -> Result<Option<String>, ClientEventError> {
        let app = self.connection.app();
        if !app.client_messages_enabled {
            return Err(ClientEventError::Disabled);
        }
        let kind = ChannelKind::from_name(channel);
        if !kind.requires_auth() {
            return Err(ClientEventError::NotPrivate);
        }
        if !self.connection.is_subscribed(channel) {
            return Err(ClientEventError::NotSubscribed(channel.to_string()));
        }
        if payload_size(data) > app.max_payload_bytes {
            return Err(ClientEventError::TooLarge(app.max_payload_bytes));
        }

        match self.connection.check_rate(now_millis()) {
            RateDecision::Allowed => {}
            RateDecision::Rejected => return Err(ClientEventError::RateLimited),
            RateDecision::Exceeded => return Err(ClientEventError::RateExceeded),
        }

        Ok(match kind {
            ChannelKind::Presence => self.connection.member_id(channel),
            _ => None,
        })
    }

    fn reply(&self, frame: &Frame) -> Result<(), SessionError> {
        match self.connection.send(frame) {
            Ok(()) => Ok(()),
            Err(SendError::QueueFull) => {
                warn!(socket = %self.connection.socket_id(), "Slow consumer, closing connection");
                self.close(CloseCode::OverCapacity);
                Err(SessionError::Closed(CloseCode::OverCapacity))
            }
            Err(SendError::Closed) => Err(SessionError::Closed(
                self.connection.close_code().unwrap_or(CloseCode::Normal),
            )),
            Err(SendError::Encode(e)) => {
                warn!(socket = %self.connection.socket_id(), error = %e, "Failed to encode reply");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{App, MemoryAppRegistry};
    use crate::auth;
    use crate::connection::Outbound;
    use crate::engine::EngineConfig;
    use crate::webhook::RecordingWebhookSink;
    use serde_json::json;
    use tenvis_herald_bus::MemoryBus;

    struct Client {
        session: Session,
        outbound: Outbound,
    }

    impl Client {
        fn socket_id(&self) -> String {
            self.session.connection().socket_id().to_string()
        }

        fn next(&mut self) -> Option<Frame> {
            self.outbound
                .try_recv()
                .ok()
                .map(|text| codec::decode(&text).unwrap())
        }

        fn drain(&mut self) {
            while self.outbound.try_recv().is_ok() {}
        }

        async fn send(&self, value: Value) -> Result<Handled, SessionError> {
            self.session.handle_text(&value.to_string()).await
        }

        async fn subscribe_signed(&mut self, app: &App, channel: &str, channel_data: Option<&str>) {
            let auth = auth::sign_channel(app, &self.socket_id(), channel, channel_data);
            let mut data = json!({"channel": channel, "auth": auth});
            if let Some(channel_data) = channel_data {
                data["channel_data"] = json!(channel_data);
            }
            self.send(json!({"event": "pusher:subscribe", "data": data}))
                .await
                .unwrap();
        }
    }

    fn app() -> App {
        App::new("1", "key", "secret").with_client_messages(true)
    }

    fn engine(app: App) -> (Arc<Engine>, Arc<RecordingWebhookSink>) {
        let webhooks = Arc::new(RecordingWebhookSink::new());
        let engine = Engine::new(
            Arc::new(MemoryAppRegistry::new([app])),
            Arc::new(MemoryBus::new().transport()),
            webhooks.clone(),
            EngineConfig::default(),
        );
        (engine, webhooks)
    }

    async fn connect(engine: &Arc<Engine>) -> Client {
        let accepted = engine.connections().accept("key").await.unwrap();
        let mut client = Client {
            session: engine.session(accepted.connection),
            outbound: accepted.outbound,
        };
        client.drain();
        client
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (engine, _) = engine(app());
        let mut client = connect(&engine).await;

        client.send(json!({"event": "pusher:ping", "data": {}})).await.unwrap();
        assert_eq!(client.next().unwrap().event, "pusher:pong");

        client.send(json!({"event": "pusher:pong"})).await.unwrap();
        assert!(client.next().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_reports_what_happened() {
        let (engine, _) = engine(app());
        let client = connect(&engine).await;
        let subscribe = json!({"event": "pusher:subscribe", "data": {"channel": "game-1"}});

        assert_eq!(client.send(subscribe.clone()).await.unwrap(), Handled::Subscribed);
        assert_eq!(client.send(subscribe).await.unwrap(), Handled::Control);
        assert_eq!(
            client
                .send(json!({"event": "pusher:subscribe", "data": {"channel": "private-x"}}))
                .await
                .unwrap(),
            Handled::SubscriptionRefused
        );
        assert_eq!(
            client
                .send(json!({"event": "pusher:unsubscribe", "data": {"channel": "game-1"}}))
                .await
                .unwrap(),
            Handled::Unsubscribed
        );
    }

    #[tokio::test]
    async fn test_malformed_frames_are_protocol_errors() {
        let (engine, _) = engine(app());
        let client = connect(&engine).await;

        let err = client.session.handle_text("{not json").await.unwrap_err();
        assert_eq!(err.close_code(), CloseCode::ProtocolViolation);
        let err = client
            .send(json!({"event": "pusher:unknown", "data": {}}))
            .await
            .unwrap_err();
        assert_eq!(err.close_code(), CloseCode::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_private_subscription() {
        let app = app();
        let (engine, _) = engine(app.clone());
        let mut c1 = connect(&engine).await;
        let mut c2 = connect(&engine).await;

        c1.subscribe_signed(&app, "private-orders", None).await;
        let frame = c1.next().unwrap();
        assert_eq!(frame.event, "pusher_internal:subscription_succeeded");
        assert_eq!(frame.channel.as_deref(), Some("private-orders"));

        c2.send(json!({"event": "pusher:subscribe", "data": {"channel": "private-orders"}}))
            .await
            .unwrap();
        let frame = c2.next().unwrap();
        assert_eq!(frame.event, "pusher:subscription_error");
        let data = frame.data.unwrap();
        assert_eq!(data["type"], "AuthError");
        assert_eq!(data["status"], 401);

        let info = engine.channels().channel_info("1", "private-orders");
        assert_eq!(info.local_subscriptions, 1);
        assert!(!c2.session.connection().is_subscribed("private-orders"));
    }

    #[tokio::test]
    async fn test_presence_subscription_lists_members() {
        let app = app();
        let (engine, webhooks) = engine(app.clone());
        let mut alice = connect(&engine).await;
        let mut bob = connect(&engine).await;

        alice
            .subscribe_signed(&app, "presence-game-1", Some(r#"{"user_id":"alice"}"#))
            .await;
        let frame = alice.next().unwrap();
        let data: Value = serde_json::from_str(frame.data.unwrap().as_str().unwrap()).unwrap();
        assert_eq!(data["presence"]["count"], 1);

        bob.subscribe_signed(&app, "presence-game-1", Some(r#"{"user_id":"bob","user_info":{"name":"Bob"}}"#))
            .await;
        let frame = bob.next().unwrap();
        let data: Value = serde_json::from_str(frame.data.unwrap().as_str().unwrap()).unwrap();
        assert_eq!(data["presence"]["count"], 2);
        assert_eq!(data["presence"]["ids"], json!(["alice", "bob"]));
        assert_eq!(data["presence"]["hash"]["bob"]["name"], "Bob");

        let added = alice.next().unwrap();
        assert_eq!(added.event, "pusher_internal:member_added");
        assert!(bob.next().is_none());
        assert_eq!(
            webhooks.names(),
            vec!["channel_occupied", "member_added", "member_added"]
        );
    }

    #[tokio::test]
    async fn test_client_event_excludes_sender() {
        let app = app();
        let (engine, webhooks) = engine(app.clone());
        let mut a = connect(&engine).await;
        let mut b = connect(&engine).await;
        for client in [&mut a, &mut b] {
            client.subscribe_signed(&app, "private-chat", None).await;
            client.drain();
        }

        a.send(json!({"event": "client-typing", "channel": "private-chat", "data": {"who": "a"}}))
            .await
            .unwrap();

        assert!(a.next().is_none());
        let frame = b.next().unwrap();
        assert_eq!(frame.event, "client-typing");
        assert_eq!(frame.data, Some(json!({"who": "a"})));
        assert!(frame.user_id.is_none());
        assert!(webhooks.names().contains(&"client_event"));
    }

    #[tokio::test]
    async fn test_client_event_on_presence_carries_user_id() {
        let app = app();
        let (engine, _) = engine(app.clone());
        let mut a = connect(&engine).await;
        let mut b = connect(&engine).await;
        a.subscribe_signed(&app, "presence-room", Some(r#"{"user_id":"7"}"#)).await;
        b.subscribe_signed(&app, "presence-room", Some(r#"{"user_id":"8"}"#)).await;
        a.drain();
        b.drain();

        a.send(json!({"event": "client-wave", "channel": "presence-room", "data": {}}))
            .await
            .unwrap();
        assert_eq!(b.next().unwrap().user_id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_client_event_rejections() {
        let app = app();
        let (engine, _) = engine(app.clone());
        let mut client = connect(&engine).await;
        client
            .send(json!({"event": "pusher:subscribe", "data": {"channel": "public"}}))
            .await
            .unwrap();
        client.drain();

        client
            .send(json!({"event": "client-x", "channel": "public", "data": {}}))
            .await
            .unwrap();
        let frame = client.next().unwrap();
        assert_eq!(frame.event, "pusher:error");
        assert_eq!(frame.data.unwrap()["code"], 4009);

        client
            .send(json!({"event": "client-x", "channel": "private-other", "data": {}}))
            .await
            .unwrap();
        assert_eq!(client.next().unwrap().data.unwrap()["code"], 4009);
    }

    #[tokio::test]
    async fn test_client_events_disabled() {
        let app = App::new("1", "key", "secret");
        let (engine, _) = engine(app.clone());
        let mut client = connect(&engine).await;
        client.subscribe_signed(&app, "private-chat", None).await;
        client.drain();

        client
            .send(json!({"event": "client-x", "channel": "private-chat", "data": {}}))
            .await
            .unwrap();
        let frame = client.next().unwrap();
        assert_eq!(frame.data.unwrap()["code"], 4009);
    }

    #[tokio::test]
    async fn test_client_event_rate_limit() {
        let app = App {
            max_client_events_per_second: 2,
            ..app()
        };
        let (engine, _) = engine(app.clone());
        let mut client = connect(&engine).await;
        client.subscribe_signed(&app, "private-chat", None).await;
        client.drain();

        let event = json!({"event": "client-x", "channel": "private-chat", "data": {}});
        for _ in 0..2 {
            client.send(event.clone()).await.unwrap();
        }
        assert!(client.next().is_none());

        // Over the limit: refused but still connected
        for _ in 0..2 {
            client.send(event.clone()).await.unwrap();
            assert_eq!(client.next().unwrap().data.unwrap()["code"], 4301);
        }

        // Twice the limit: closed
        let err = client.send(event).await.unwrap_err();
        assert_eq!(err.close_code(), CloseCode::RateLimited);
        assert_eq!(engine.connections().connection_count(), 0);
    }
}
