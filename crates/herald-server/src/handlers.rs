//! Connection handlers for Herald server.
//!
//! This module handles the WebSocket lifecycle: protocol negotiation,
//! admission, the read loop feeding the session and the writer task
//! draining the connection's queue.

use crate::api;
use crate::config::{AdapterDriver, AdapterSettings, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use herald_protocol::{version, CloseCode, Frame};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_herald_bus::{BusTransport, MemoryBus, RedisConfig, RedisTransport};
use tenvis_herald_core::message::now_millis;
use tenvis_herald_core::{
    Accepted, AppRegistry, CachedAppRegistry, Connection, Engine, Handled, MemoryAppRegistry,
    Outbound, SessionError, TracingWebhookSink,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Time given to the writer to send the closing frames after the read side ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared server state.
pub struct AppState {
    /// The realtime engine.
    pub engine: Arc<Engine>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(engine: Arc<Engine>, config: Config) -> Self {
        Self { engine, config }
    }
}

fn build_bus(settings: &AdapterSettings) -> Result<Arc<dyn BusTransport>> {
    let bus: Arc<dyn BusTransport> = match settings.driver {
        AdapterDriver::Local => Arc::new(MemoryBus::new().transport()),
        AdapterDriver::Redis => Arc::new(RedisTransport::new(RedisConfig {
            url: settings.redis_url.clone(),
            ..RedisConfig::default()
        })?),
    };
    Ok(bus)
}

/// Build the engine described by `config`. It still has to be started.
///
/// # Errors
///
/// Returns an error if the bus cannot be configured.
pub fn build_engine(config: &Config) -> Result<Arc<Engine>> {
    let apps: Arc<dyn AppRegistry> = Arc::new(MemoryAppRegistry::new(config.apps.iter().cloned()));
    let registry = Arc::new(CachedAppRegistry::new(
        apps,
        Duration::from_millis(config.app_cache_ttl_ms),
    ));
    let bus = build_bus(&config.adapter)?;

    Ok(Engine::new(
        registry,
        bus,
        Arc::new(TracingWebhookSink),
        config.engine_config(),
    ))
}

/// All HTTP and WebSocket routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/app/:key", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
    }

    let engine = build_engine(&config)?;
    engine.start().await?;

    let gauge_engine = Arc::clone(&engine);
    let gauge = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            metrics::set_bus_degraded(gauge_engine.adapter().is_degraded());
        }
    });

    let state = Arc::new(AppState::new(Arc::clone(&engine), config.clone()));
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, node = %engine.adapter().node_id(), "Herald server listening");
    info!("WebSocket endpoint: ws://{addr}/app/{{key}}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gauge.abort();
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let adapter = state.engine.adapter();
    let degraded = adapter.is_degraded();
    metrics::set_bus_degraded(degraded);
    axum::Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": adapter.node_id(),
        "bus": adapter.bus_name(),
        "degraded": degraded,
        "connections": state.engine.connections().connection_count(),
    }))
}

/// Query string of the WebSocket URL.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    protocol: Option<String>,
    client: Option<String>,
    version: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(key): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max_size = state.config.limits.max_message_size;
    ws.max_message_size(max_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, key, params))
}

/// Refuse a handshake: an error frame, then the close frame.
async fn reject(mut socket: WebSocket, code: CloseCode) {
    metrics::record_rejection(code.code());
    for message in closing_messages(code) {
        if socket.send(message).await.is_err() {
            return;
        }
    }
}

/// The last frames a socket sees: a `pusher:error` for anything but a
/// normal close, then the close frame.
fn closing_messages(code: CloseCode) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2);
    if code != CloseCode::Normal {
        if let Ok(text) = herald_protocol::encode(&Frame::error(code.code(), code.reason())) {
            messages.push(Message::Text(text));
        }
    }
    messages.push(close_message(code));
    messages
}

fn close_message(code: CloseCode) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.code(),
        reason: code.reason().into(),
    }))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, key: String, params: ConnectParams) {
    if let Err(code) = version::negotiate(params.protocol.as_deref()) {
        warn!(app_key = %key, protocol = ?params.protocol, "Refusing handshake: protocol version");
        reject(socket, code).await;
        return;
    }

    let Accepted {
        connection,
        outbound,
    } = match state.engine.connections().accept(&key).await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(app_key = %key, error = %e, "Refusing handshake");
            reject(socket, e.close_code()).await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    let socket_id = connection.socket_id().to_string();
    debug!(
        app = %connection.app().id,
        socket = %socket_id,
        client = ?params.client,
        version = ?params.version,
        "WebSocket connected"
    );

    let (sender, mut receiver) = socket.split();
    let mut writer = tokio::spawn(write_loop(sender, Arc::clone(&connection), outbound));
    let session = state.engine.session(Arc::clone(&connection));

    loop {
        tokio::select! {
            code = connection.closed() => {
                debug!(socket = %socket_id, code = code.code(), "Closed by server");
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_message(text.len(), "inbound");

                        match session.handle_text(&text).await {
                            Ok(Handled::Subscribed) => metrics::record_subscription(),
                            Ok(_) => {}
                            Err(e) => {
                                if let SessionError::Protocol(_) = &e {
                                    metrics::record_error("protocol");
                                }
                                debug!(socket = %socket_id, error = %e, "Closing after session error");
                                session.close(e.close_code());
                                break;
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(socket = %socket_id, "Binary frame refused");
                        metrics::record_error("protocol");
                        session.close(CloseCode::ProtocolViolation);
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Pings are answered by the WebSocket layer
                        connection.touch(now_millis());
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(socket = %socket_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(socket = %socket_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(socket = %socket_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Idempotent: a no-op when the server already closed the connection
    state.engine.connections().disconnect(&socket_id, CloseCode::Normal);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    debug!(socket = %socket_id, "WebSocket disconnected");
}

/// Forward queued frames to the socket until the connection closes.
///
/// Frames still queued at that point are dropped: the socket only gets the
/// closing frames.
async fn write_loop<S>(mut sender: S, connection: Arc<Connection>, mut outbound: Outbound)
where
    S: Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            code = connection.closed() => {
                outbound.close();
                for message in closing_messages(code) {
                    if sender.send(message).await.is_err() {
                        return;
                    }
                }
                return;
            }

            Some(text) = outbound.recv() => {
                metrics::record_message(text.len(), "outbound");
                if sender.send(Message::Text(text.to_string())).await.is_err() {
                    connection.close(CloseCode::Normal);
                    return;
                }
            }
        }
    }
}
