//! HTTP and WebSocket handlers for the Synclink server.
//!
//! Every route except `/health` requires a bearer token, taken from the
//! `Authorization` header or, for browsers opening a WebSocket, the `token`
//! query parameter.

use crate::config::Config;
use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, HeaderMap, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use synclink_core::time::now_millis;
use synclink_core::topic::{AdminKind, ChatKind};
use synclink_core::{
    events, Envelope, ErrorKind, Identity, MemoryBus, MemoryStore, NewMessage, SessionStore,
    Subject, SyncRequest,
};
use synclink_protocol::{MessageId, SyncCursor, Version, PROTOCOL_VERSION};
use synclink_transport::websocket;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// How often the bundled bus broker and store drop expired entries.
const RETENTION_SWEEP: Duration = Duration::from_secs(60);

/// Run the HTTP/WebSocket server with the bundled in-process bus and store.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let validator = config.token_validator();
    if validator.is_empty() {
        warn!("No tokens configured in [auth]; every connection will be rejected");
    }

    let bus = MemoryBus::new();
    let store = Arc::new(MemoryStore::new());
    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::new(bus.client()),
        Arc::clone(&store) as Arc<dyn SessionStore>,
        Arc::new(validator),
    ));

    let mut tasks = state.spawn_background();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_SWEEP);
        loop {
            interval.tick().await;
            let now = now_millis();
            let expired = bus.expire_at(now);
            let pruned = store.prune_tombstones_at(now).await;
            if expired > 0 || pruned > 0 {
                debug!(expired, pruned, "Expired bus messages and tombstones");
            }
        }
    }));

    let app = router(Arc::clone(&state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Synclink server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let closed = state.hub.close_all().await;
    state.bridge().shutdown().await;
    for task in tasks {
        task.abort();
    }
    info!(closed, "Synclink server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/heartbeat", post(heartbeat_handler))
        .route("/api/presence", get(own_presence_handler))
        .route("/api/presence/stats", get(presence_stats_handler))
        .route("/api/presence/:user_id", get(user_presence_handler))
        .route("/api/sync", post(sync_handler))
        .route(
            "/api/sessions/:session_id/messages",
            post(create_message_handler),
        )
        .route("/api/admin/broadcast", post(broadcast_handler))
        .with_state(state)
}

/// The identity behind a request's bearer token.
pub struct Authenticated(pub Identity);

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

fn query_token(uri: &Uri) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(uri).ok()?.0.token
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .or_else(|| query_token(&parts.uri))
            .unwrap_or_default();
        match state.validator.validate(&token).await {
            Ok(identity) => Ok(Self(identity)),
            Err(e) => {
                debug!(path = %parts.uri.path(), error = %e, "Rejected credential");
                Err(e.into())
            }
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "bridge": state.bridge().state().as_str(),
        "connections": stats.connections,
        "users": stats.users,
    }))
}

#[derive(Debug, Deserialize)]
struct UpgradeQuery {
    #[serde(default)]
    protocol: Option<String>,
}

/// Reject a client-announced protocol version whose major differs from ours.
/// Clients that announce nothing are assumed to speak the current version.
fn check_protocol(announced: Option<&str>) -> Result<(), ApiError> {
    let Some(announced) = announced else {
        return Ok(());
    };
    let version: Version = announced.parse().map_err(|e: &str| {
        ApiError::new(
            ErrorKind::InvalidRequest,
            format!("invalid protocol version {announced:?}: {e}"),
        )
    })?;
    if !PROTOCOL_VERSION.is_compatible_with(&version) {
        return Err(ApiError::new(
            ErrorKind::InvalidRequest,
            format!("protocol {version} is not supported, server speaks {PROTOCOL_VERSION}"),
        ));
    }
    Ok(())
}

/// WebSocket upgrade handler. Authentication and protocol negotiation happen
/// before the upgrade.
async fn ws_handler(
    Authenticated(identity): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(query): Query<UpgradeQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(e) = check_protocol(query.protocol.as_deref()) {
        debug!(user = %identity.user_id, error = %e, "Rejected protocol version");
        return Err(e);
    }
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr.to_string());
    Ok(ws
        .max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, identity, remote_addr, state)))
}

/// Hand an upgraded socket to the hub and wait for it to close.
async fn handle_websocket(
    socket: WebSocket,
    identity: Identity,
    remote_addr: Option<String>,
    state: Arc<AppState>,
) {
    metrics::record_connection();
    let (sink, source) =
        websocket::split(socket, remote_addr.clone(), &state.config.websocket_config());
    let handle = state.hub.attach(identity, sink, source).await;
    debug!(connection = %handle.id(), remote = ?remote_addr, "WebSocket connected");

    handle.closed().await;
    debug!(
        connection = %handle.id(),
        dropped = handle.dropped(),
        "WebSocket disconnected"
    );
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    #[serde(default)]
    device_type: String,
    #[serde(default)]
    client_version: String,
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
    Json(body): Json<HeartbeatBody>,
) -> impl IntoResponse {
    state.presence.heartbeat(
        &identity.user_id,
        &identity.device_id,
        &body.device_type,
        &body.client_version,
    );
    Json(json!({ "message": "ok", "server_time": now_millis() }))
}

async fn own_presence_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
) -> impl IntoResponse {
    Json(json!({
        "user_id": identity.user_id,
        "devices": state.presence.devices(&identity.user_id),
    }))
}

async fn user_presence_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(_): Authenticated,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    Json(state.presence.user_presence(&user_id))
}

async fn presence_stats_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(_): Authenticated,
) -> impl IntoResponse {
    Json(json!({
        "online": state.presence.online_count(),
        "active_today": state.presence.active_today_count(now_millis()),
    }))
}

/// Catch-up request body. Identity comes from the token; `user_id` and
/// `device_id`, when present, must match it.
#[derive(Debug, Deserialize)]
struct SyncBody {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    last_sync_time: Option<u64>,
    #[serde(default, alias = "last_msg_id")]
    last_message_id: Option<MessageId>,
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
    Json(body): Json<SyncBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.user_id.as_ref().is_some_and(|user| *user != identity.user_id) {
        return Err(ApiError::forbidden("cannot sync another user's data"));
    }
    let device_id = body.device_id.unwrap_or(identity.device_id);
    let cursor = SyncCursor {
        last_sync_time: body.last_sync_time,
        last_message_id: body.last_message_id,
    };
    let request = SyncRequest::new(identity.user_id, device_id, &cursor);

    let start = Instant::now();
    let result = state.sync.handle(&request).await;
    let outcome = if result.is_ok() { "ok" } else { "failed" };
    metrics::record_sync(start.elapsed().as_secs_f64(), outcome);

    Ok(Json(result?))
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Debug, Deserialize)]
struct CreateMessageBody {
    content: String,
    #[serde(default)]
    parent_id: Option<MessageId>,
    #[serde(default = "default_role")]
    role: String,
}

/// Store a message and fan it out to the user's devices.
///
/// Responds 503 without writing when the bus is down, and 503 after writing
/// if the durable publish is refused; devices then pick the message up on
/// their next catch-up.
async fn create_message_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
    Path(session_id): Path<String>,
    Json(body): Json<CreateMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let subject = Subject::chat(identity.user_id.as_str(), session_id.as_str(), ChatKind::Msg)?;
    if !state.bridge().is_connected() {
        return Err(ApiError::unavailable("message bus is unavailable"));
    }

    let message = state
        .store
        .create_message(NewMessage {
            session_id,
            user_id: identity.user_id.clone(),
            parent_id: body.parent_id,
            role: body.role,
            content: body.content,
        })
        .await?;

    let payload = serde_json::to_value(&message)
        .map_err(|e| ApiError::new(ErrorKind::InvalidRequest, e.to_string()))?;
    let envelope = Envelope::new(events::MESSAGE_CREATED, payload)
        .with_user(&identity.user_id)
        .with_device(&identity.device_id);
    let ack = state.bridge().publish_durable(&subject, &envelope).await?;
    debug!(subject = %subject, message_id = message.id, sequence = ack.sequence, "Message published");

    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
struct BroadcastBody {
    message: String,
    #[serde(default)]
    data: Value,
}

/// Publish an announcement to every connected admin console.
async fn broadcast_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
    Json(body): Json<BroadcastBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !identity.is_admin {
        return Err(ApiError::forbidden("admin access required"));
    }
    if !state.bridge().is_connected() {
        return Err(ApiError::unavailable("message bus is unavailable"));
    }

    let subject = Subject::admin(AdminKind::Broadcast);
    let envelope = Envelope::new(
        events::BROADCAST,
        json!({ "message": body.message, "data": body.data }),
    )
    .with_user(&identity.user_id);
    state.bridge().publish(&subject, &envelope).await;
    info!(admin = %identity.user_id, "Broadcast published");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "topic": subject.to_string(), "id": envelope.id })),
    ))
}
