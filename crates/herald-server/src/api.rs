//! HTTP API for backends.
//!
//! Every route is signed with the app secret: `auth_key`, `auth_timestamp`
//! and `auth_signature` travel in the query string, and the signature covers
//! the method, the path and every other query parameter.

use axum::{
    body::Bytes,
    extract::{OriginalUri, Path, Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tenvis_herald_core::auth::{self, ApiAuthError};
use tenvis_herald_core::{App, ChannelKind, Engine, PublishReceipt, TriggerError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::handlers::AppState;
use crate::metrics;

/// Most events in one batch.
pub const MAX_BATCH_EVENTS: usize = 10;

/// API error type.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Signature checks failed.
    #[error("Authentication failed: {0}")]
    Unauthorized(#[from] ApiAuthError),

    /// Unknown app.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Payload over the app's limit.
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// The app registry could not be reached.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<TriggerError> for ApiError {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::PayloadTooLarge { .. } => ApiError::PayloadTooLarge(e.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, "API request failed");
        } else {
            debug!(error = %self, "API request refused");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

type Params = Vec<(String, String)>;

/// API routes, to be merged into the server router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/apps/:app_id/events", post(trigger_event))
        .route("/apps/:app_id/batch_events", post(trigger_batch))
        .route("/apps/:app_id/channels", get(list_channels))
        .route("/apps/:app_id/channels/:channel", get(channel_info))
        .route("/apps/:app_id/channels/:channel/users", get(channel_users))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Requested `info` attributes.
fn info_fields(value: Option<&str>) -> Vec<&str> {
    value
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Resolve the app and check the request signature, and for requests with
/// a body, that the body is the signed one.
async fn authenticate(
    state: &AppState,
    app_id: &str,
    method: &str,
    uri: &Uri,
    params: &Params,
    body: Option<&[u8]>,
) -> ApiResult<Arc<App>> {
    let app = state
        .engine
        .registry()
        .find_by_id(app_id)
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("app {app_id}")))?;

    auth::verify_api_request(&app, method, uri.path(), params, now_secs())?;
    if let Some(body) = body {
        auth::verify_body(params, body)?;
    }
    Ok(app)
}

/// One event as posted by a backend.
#[derive(Debug, Deserialize)]
struct TriggerRequest {
    name: String,
    data: Value,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channels: Option<Vec<String>>,
    #[serde(default)]
    socket_id: Option<String>,
    #[serde(default)]
    info: Option<String>,
}

impl TriggerRequest {
    fn channels(&self) -> Vec<String> {
        match (&self.channels, &self.channel) {
            (Some(channels), _) => channels.clone(),
            (None, Some(channel)) => vec![channel.clone()],
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    batch: Vec<TriggerRequest>,
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Attributes of one channel requested with `info`.
fn attributes(engine: &Engine, app: &App, channel: &str, info: &[&str]) -> Map<String, Value> {
    let details = engine.channels().channel_info(&app.id, channel);
    let mut attributes = Map::new();
    if info.contains(&"subscription_count") {
        attributes.insert("subscription_count".into(), json!(details.subscription_count));
    }
    if let (true, Some(users)) = (info.contains(&"user_count"), details.user_count) {
        attributes.insert("user_count".into(), json!(users));
    }
    attributes
}

fn receipt_json(receipt: PublishReceipt) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("delivered".into(), json!(receipt.delivered));
    body.insert("instances".into(), json!(receipt.instances));
    body
}

/// `POST /apps/{app_id}/events`
async fn trigger_event(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<Params>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let app = authenticate(&state, &app_id, "POST", &uri, &params, Some(&body)).await?;
    let request: TriggerRequest = parse_body(&body)?;
    let channels = request.channels();

    let receipt = state
        .engine
        .trigger(&app, &channels, &request.name, request.data, request.socket_id)
        .await?;
    metrics::record_api_events(channels.len());

    let mut response = receipt_json(receipt);
    let info = info_fields(request.info.as_deref());
    if !info.is_empty() {
        let per_channel: Map<String, Value> = channels
            .iter()
            .map(|c| (c.clone(), Value::Object(attributes(&state.engine, &app, c, &info))))
            .collect();
        response.insert("channels".into(), Value::Object(per_channel));
    }
    Ok(Json(Value::Object(response)))
}

/// `POST /apps/{app_id}/batch_events`
async fn trigger_batch(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<Params>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let app = authenticate(&state, &app_id, "POST", &uri, &params, Some(&body)).await?;
    let request: BatchRequest = parse_body(&body)?;

    if request.batch.len() > MAX_BATCH_EVENTS {
        return Err(ApiError::BadRequest(format!(
            "Batch of {} events exceeds {MAX_BATCH_EVENTS}",
            request.batch.len()
        )));
    }
    // All or nothing: validate every event before publishing any
    for event in &request.batch {
        Engine::validate_trigger(&app, &event.channels(), &event.name, &event.data)?;
    }

    let mut results = Vec::with_capacity(request.batch.len());
    for event in request.batch {
        let channels = event.channels();
        let receipt = state
            .engine
            .trigger(&app, &channels, &event.name, event.data, event.socket_id)
            .await?;
        metrics::record_api_events(channels.len());

        let mut result = receipt_json(receipt);
        let info = info_fields(event.info.as_deref());
        if let (false, Some(first)) = (info.is_empty(), channels.first()) {
            result.extend(attributes(&state.engine, &app, first, &info));
        }
        results.push(Value::Object(result));
    }

    Ok(Json(json!({ "batch": results })))
}

/// `GET /apps/{app_id}/channels`
async fn list_channels(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<Params>,
) -> ApiResult<Json<Value>> {
    let app = authenticate(&state, &app_id, "GET", &uri, &params, None).await?;
    let prefix = param(&params, "filter_by_prefix");
    let info = info_fields(param(&params, "info"));

    if info.contains(&"user_count") && !prefix.is_some_and(|p| p.starts_with("presence-")) {
        return Err(ApiError::BadRequest(
            "user_count requires filter_by_prefix=presence-".into(),
        ));
    }

    let mut channels = Map::new();
    for channel in state.engine.channels().channels(&app.id, prefix) {
        let mut attributes = Map::new();
        if let (true, Some(users)) = (info.contains(&"user_count"), channel.user_count) {
            attributes.insert("user_count".into(), json!(users));
        }
        channels.insert(channel.name, Value::Object(attributes));
    }

    Ok(Json(json!({ "channels": channels })))
}

/// `GET /apps/{app_id}/channels/{channel}`
async fn channel_info(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel)): Path<(String, String)>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<Params>,
) -> ApiResult<Json<Value>> {
    let app = authenticate(&state, &app_id, "GET", &uri, &params, None).await?;
    let info = info_fields(param(&params, "info"));
    let kind = ChannelKind::from_name(&channel);

    if info.contains(&"user_count") && !kind.is_presence() {
        return Err(ApiError::BadRequest(
            "user_count is only available for presence channels".into(),
        ));
    }

    let details = state.engine.channels().channel_info(&app.id, &channel);
    let mut body = Map::new();
    body.insert("occupied".into(), json!(details.occupied));
    if info.contains(&"subscription_count") {
        body.insert("subscription_count".into(), json!(details.subscription_count));
    }
    if let (true, Some(users)) = (info.contains(&"user_count"), details.user_count) {
        body.insert("user_count".into(), json!(users));
    }

    Ok(Json(Value::Object(body)))
}

/// `GET /apps/{app_id}/channels/{channel}/users`
async fn channel_users(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel)): Path<(String, String)>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<Params>,
) -> ApiResult<Json<Value>> {
    let app = authenticate(&state, &app_id, "GET", &uri, &params, None).await?;
    if !ChannelKind::from_name(&channel).is_presence() {
        return Err(ApiError::BadRequest(format!("{channel} is not a presence channel")));
    }

    let users: Vec<Value> = state
        .engine
        .channels()
        .members(&app.id, &channel)
        .into_iter()
        .map(|m| json!({ "id": m.user_id }))
        .collect();

    Ok(Json(json!({ "users": users })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers::build_engine;
    use herald_protocol::SubscribeRequest;
    use tenvis_herald_core::Outbound;

    fn app() -> App {
        App::new("1", "key", "secret")
    }

    async fn state() -> Arc<AppState> {
        let config = Config {
            apps: vec![App {
                max_payload_bytes: 64,
                ..app()
            }],
            ..Config::default()
        };
        let engine = build_engine(&config).unwrap();
        engine.start().await.unwrap();
        Arc::new(AppState::new(engine, config))
    }

    /// Sign a request the way a backend library does.
    fn signed(method: &str, path: &str, extra: &[(&str, &str)]) -> (OriginalUri, Query<Params>) {
        let mut params: Params = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        params.push(("auth_key".into(), "key".into()));
        params.push(("auth_timestamp".into(), now_secs().to_string()));
        params.push(("auth_version".into(), "1.0".into()));
        let signature = auth::sign_api_request(&app(), method, path, &params);
        params.push(("auth_signature".into(), signature));

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let uri: Uri = format!("{path}?{query}").parse().unwrap();
        (OriginalUri(uri), Query(params))
    }

    async fn subscribe(state: &AppState, channel: &str, channel_data: Option<&str>) -> Outbound {
        let accepted = state.engine.connections().accept("key").await.unwrap();
        let connection = accepted.connection;
        let request = SubscribeRequest {
            channel: channel.into(),
            auth: Some(auth::sign_channel(&app(), connection.socket_id(), channel, channel_data)),
            channel_data: channel_data.map(str::to_string),
        };
        state.engine.channels().subscribe(&connection, &request).unwrap();
        accepted.outbound
    }

    /// Sign a POST the way a backend library does, pinning its body.
    fn signed_post(path: &str, body: &Bytes) -> (OriginalUri, Query<Params>) {
        signed("POST", path, &[("body_md5", auth::body_md5(body).as_str())])
    }

    #[tokio::test]
    async fn test_trigger_event() {
        let state = state().await;
        let _a = subscribe(&state, "game-1", None).await;

        let body = Bytes::from(
            r#"{"name":"score-update","channel":"game-1","data":"{\"score\":42}","info":"subscription_count"}"#,
        );
        let (uri, query) = signed_post("/apps/1/events", &body);
        let Json(response) = trigger_event(State(state), Path("1".into()), uri, query, body)
            .await
            .unwrap();

        assert_eq!(response["delivered"], 1);
        assert!(response["instances"].as_u64() >= Some(1));
        assert_eq!(response["channels"]["game-1"]["subscription_count"], 1);
    }

    #[tokio::test]
    async fn test_trigger_rejections() {
        let state = state().await;
        let body = Bytes::from(r#"{"name":"e","channel":"c","data":"x"}"#);

        let (uri, Query(mut params)) = signed_post("/apps/1/events", &body);
        if let Some(last) = params.last_mut() {
            last.1 = "0".repeat(64);
        }
        let err = trigger_event(
            State(Arc::clone(&state)),
            Path("1".into()),
            uri,
            Query(params),
            body.clone(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let (uri, query) = signed_post("/apps/2/events", &body);
        let err = trigger_event(State(Arc::clone(&state)), Path("2".into()), uri, query, body)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let big = Bytes::from(format!(r#"{{"name":"e","channel":"c","data":"{}"}}"#, "x".repeat(65)));
        let (uri, query) = signed_post("/apps/1/events", &big);
        let err = trigger_event(State(Arc::clone(&state)), Path("1".into()), uri, query, big)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let long_name = Bytes::from(format!(r#"{{"name":"{}","channel":"c","data":"x"}}"#, "n".repeat(201)));
        let (uri, query) = signed_post("/apps/1/events", &long_name);
        let err = trigger_event(State(state), Path("1".into()), uri, query, long_name)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_replayed_signature_with_other_body_is_refused() {
        let state = state().await;
        let mut outbound = subscribe(&state, "game-1", None).await;
        while outbound.try_recv().is_ok() {}

        let original = Bytes::from(r#"{"name":"score-update","channel":"game-1","data":"1"}"#);
        let forged = Bytes::from(r#"{"name":"score-update","channel":"game-1","data":"999"}"#);
        let (uri, query) = signed_post("/apps/1/events", &original);
        let err = trigger_event(State(Arc::clone(&state)), Path("1".into()), uri, query, forged)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert!(outbound.try_recv().is_err());

        let (uri, _) = signed_post("/apps/1/events", &original);
        let unpinned = signed("POST", "/apps/1/events", &[]).1;
        let err = trigger_event(State(state), Path("1".into()), uri, unpinned, original)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_batch_events() {
        let state = state().await;
        let _a = subscribe(&state, "a", None).await;

        let body = Bytes::from(
            r#"{"batch":[{"name":"e1","channel":"a","data":"1"},{"name":"e2","channel":"b","data":"2"}]}"#,
        );
        let (uri, query) = signed_post("/apps/1/batch_events", &body);
        let Json(response) = trigger_batch(State(Arc::clone(&state)), Path("1".into()), uri, query, body)
            .await
            .unwrap();
        assert_eq!(response["batch"][0]["delivered"], 1);
        assert_eq!(response["batch"][1]["delivered"], 0);

        let events: Vec<String> = (0..11)
            .map(|i| format!(r#"{{"name":"e","channel":"c{i}","data":"x"}}"#))
            .collect();
        let body = Bytes::from(format!(r#"{{"batch":[{}]}}"#, events.join(",")));
        let (uri, query) = signed_post("/apps/1/batch_events", &body);
        let err = trigger_batch(State(state), Path("1".into()), uri, query, body)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_channel_queries() {
        let state = state().await;
        let _a = subscribe(&state, "game-1", None).await;
        let _b = subscribe(&state, "presence-lobby", Some(r#"{"user_id":"7"}"#)).await;
        let _c = subscribe(&state, "presence-lobby", Some(r#"{"user_id":"8"}"#)).await;

        let (uri, query) = signed("GET", "/apps/1/channels", &[]);
        let Json(all) = list_channels(State(Arc::clone(&state)), Path("1".into()), uri, query)
            .await
            .unwrap();
        assert_eq!(all, json!({"channels": {"game-1": {}, "presence-lobby": {}}}));

        let (uri, query) = signed(
            "GET",
            "/apps/1/channels",
            &[("filter_by_prefix", "presence-"), ("info", "user_count")],
        );
        let Json(presence) = list_channels(State(Arc::clone(&state)), Path("1".into()), uri, query)
            .await
            .unwrap();
        assert_eq!(presence, json!({"channels": {"presence-lobby": {"user_count": 2}}}));

        let (uri, query) = signed(
            "GET",
            "/apps/1/channels/presence-lobby",
            &[("info", "subscription_count,user_count")],
        );
        let Json(info) = channel_info(
            State(Arc::clone(&state)),
            Path(("1".into(), "presence-lobby".into())),
            uri,
            query,
        )
        .await
        .unwrap();
        assert_eq!(info, json!({"occupied": true, "subscription_count": 2, "user_count": 2}));

        let (uri, query) = signed("GET", "/apps/1/channels/presence-lobby/users", &[]);
        let Json(users) = channel_users(
            State(Arc::clone(&state)),
            Path(("1".into(), "presence-lobby".into())),
            uri,
            query,
        )
        .await
        .unwrap();
        assert_eq!(users, json!({"users": [{"id": "7"}, {"id": "8"}]}));

        let (uri, query) = signed("GET", "/apps/1/channels/game-1/users", &[]);
        let err = channel_users(State(state), Path(("1".into(), "game-1".into())), uri, query)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
