//! Per-socket connection state.
//!
//! A [`Connection`] is the core's view of one client socket: its outbound
//! queue, the channels it joined and its liveness bookkeeping. The socket
//! itself is owned by the server, which drains the queue returned by
//! [`Connection::new`] and watches [`Connection::closed`].

use herald_protocol::{codec, CloseCode, Frame, ProtocolError};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::app::App;
use crate::message::now_millis;

/// A socket identifier in the `"<u32>.<u32>"` form clients expect.
pub type SocketId = String;

/// Frames waiting to be written, already serialized.
pub type Outbound = mpsc::Receiver<Arc<str>>;

/// Length of the client event rate window.
const RATE_WINDOW_MS: u64 = 1000;

/// Generate a random socket ID.
#[must_use]
pub fn generate_socket_id() -> SocketId {
    let mut rng = rand::thread_rng();
    format!("{}.{}", rng.gen::<u32>(), rng.gen::<u32>())
}

/// Errors when queueing a frame.
#[derive(Debug, Error)]
pub enum SendError {
    /// The outbound queue is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// The connection is closed.
    #[error("Connection closed")]
    Closed,

    /// The frame could not be serialized.
    #[error("Encode failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Result of counting a client event against the rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over the limit for this window.
    Rejected,
    /// More than twice the limit in one window.
    Exceeded,
}

/// Subscribed channel -> presence member id on presence channels.
///
/// Once sealed by teardown, no channel can be added.
#[derive(Debug, Default)]
struct Subscriptions {
    channels: HashMap<String, Option<String>>,
    sealed: bool,
}

#[derive(Debug, Default)]
struct RateWindow {
    started_ms: u64,
    count: u32,
}

/// A client connection.
#[derive(Debug)]
pub struct Connection {
    socket_id: SocketId,
    app: Arc<App>,
    sender: mpsc::Sender<Arc<str>>,
    subscriptions: Mutex<Subscriptions>,
    last_activity: AtomicU64,
    ping_sent: AtomicBool,
    authenticated: AtomicBool,
    closed: AtomicBool,
    close_code: AtomicU16,
    close_notify: Notify,
    rate: Mutex<RateWindow>,
}

impl Connection {
    /// Create a connection with a fresh socket id and an outbound queue of
    /// `queue_capacity` frames.
    #[must_use]
    pub fn new(app: Arc<App>, queue_capacity: usize) -> (Arc<Self>, Outbound) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let connection = Self {
            socket_id: generate_socket_id(),
            app,
            sender,
            subscriptions: Mutex::new(Subscriptions::default()),
            last_activity: AtomicU64::new(now_millis()),
            ping_sent: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_code: AtomicU16::new(0),
            close_notify: Notify::new(),
            rate: Mutex::new(RateWindow::default()),
        };
        (Arc::new(connection), receiver)
    }

    /// Get the socket ID.
    #[must_use]
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Get the owning app.
    #[must_use]
    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    /// Serialize and queue a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed, its queue is full or
    /// the frame cannot be encoded.
    pub fn send(&self, frame: &Frame) -> Result<(), SendError> {
        let text = codec::encode(frame)?;
        self.send_raw(Arc::from(text))
    }

    /// Queue an already serialized frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or its queue is full.
    pub fn send_raw(&self, text: Arc<str>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })?;
        trace!(socket = %self.socket_id, "Frame queued");
        Ok(())
    }

    /// Record inbound activity.
    pub fn touch(&self, now_ms: u64) {
        self.last_activity.store(now_ms, Ordering::Relaxed);
        self.ping_sent.store(false, Ordering::Relaxed);
    }

    /// Last inbound activity in epoch milliseconds.
    #[must_use]
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Mark that the server pinged this connection.
    ///
    /// Returns `true` if no ping was outstanding.
    pub fn mark_ping_sent(&self) -> bool {
        !self.ping_sent.swap(true, Ordering::Relaxed)
    }

    /// Check if a server ping is outstanding.
    #[must_use]
    pub fn ping_sent(&self) -> bool {
        self.ping_sent.load(Ordering::Relaxed)
    }

    /// Record a verified private/presence signature.
    pub fn mark_authenticated(&self) {
        if !self.authenticated.swap(true, Ordering::Relaxed) {
            debug!(socket = %self.socket_id, "Connection authenticated");
        }
    }

    /// Check if the connection ever presented a valid signature.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Close the connection.
    ///
    /// Returns `true` if this call closed it. The first close code wins.
    pub fn close(&self, code: CloseCode) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_code.store(code.code(), Ordering::Release);
        self.close_notify.notify_waiters();
        debug!(socket = %self.socket_id, code = code.code(), "Connection closed");
        true
    }

    /// Check if the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The close code, once closed.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self.close_code.load(Ordering::Acquire) {
            0 => None,
            code => CloseCode::from_code(code),
        }
    }

    /// Wait until the connection is closed and return the close code.
    pub async fn closed(&self) -> CloseCode {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return self.close_code().unwrap_or(CloseCode::Normal);
            }
            notified.await;
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a subscription.
    ///
    /// Returns `false` if already subscribed or the subscriptions were
    /// sealed by [`seal_channels`](Self::seal_channels).
    pub fn add_channel(&self, channel: &str, member_id: Option<String>) -> bool {
        let mut subscriptions = self.subscriptions();
        if subscriptions.sealed || subscriptions.channels.contains_key(channel) {
            return false;
        }
        subscriptions.channels.insert(channel.to_string(), member_id);
        true
    }

    /// Forget a subscription, returning the presence member id it carried.
    pub fn remove_channel(&self, channel: &str) -> Option<Option<String>> {
        self.subscriptions().channels.remove(channel)
    }

    /// Refuse every later [`add_channel`](Self::add_channel) and return the
    /// channels subscribed so far.
    pub fn seal_channels(&self) -> Vec<String> {
        let mut subscriptions = self.subscriptions();
        subscriptions.sealed = true;
        subscriptions.channels.keys().cloned().collect()
    }

    /// Check if subscribed to a channel.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions().channels.contains_key(channel)
    }

    /// Presence member id used on a channel.
    #[must_use]
    pub fn member_id(&self, channel: &str) -> Option<String> {
        self.subscriptions().channels.get(channel).cloned().flatten()
    }

    /// Subscribed channel names.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.subscriptions().channels.keys().cloned().collect()
    }

    /// Number of subscribed channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.subscriptions().channels.len()
    }

    /// Count one client event against the per-second limit.
    pub fn check_rate(&self, now_ms: u64) -> RateDecision {
        let limit = self.app.max_client_events_per_second;
        if limit == 0 {
            return RateDecision::Allowed;
        }

        let Ok(mut window) = self.rate.lock() else {
            return RateDecision::Allowed;
        };
        if now_ms.saturating_sub(window.started_ms) >= RATE_WINDOW_MS {
            window.started_ms = now_ms;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);

        if window.count <= limit {
            RateDecision::Allowed
        } else if window.count > limit.saturating_mul(2) {
            RateDecision::Exceeded
        } else {
            RateDecision::Rejected
        }
    }
}
