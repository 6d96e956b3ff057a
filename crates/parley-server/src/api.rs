use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_shared::constants::HEARTBEAT_INTERVAL_SECS;
use parley_shared::{ConnectionId, ConversationId, Message, OutgoingMessage, SharedError, UserId};
use parley_store::{MessageStore, UserDirectory};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::identity::{verify_within, CredentialVerifier, Identity, IdentityError};
use crate::lifecycle::ConnectionLifecycle;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::router::{DeliveryOutcome, DeliveryRouter};
use crate::socket::ws_handler;
use crate::transport::SocketHub;

/// Header naming the caller's own live connection, so a send made from a
/// connected client is not echoed back to it.
pub const ORIGIN_CONNECTION_HEADER: &str = "x-connection-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub hub: Arc<SocketHub>,
    pub lifecycle: Arc<ConnectionLifecycle>,
    pub router: Arc<DeliveryRouter>,
    pub messages: Arc<dyn MessageStore>,
    pub directory: Arc<dyn UserDirectory>,
}

impl AppState {
    /// Wire the delivery core around one store that keeps both the message
    /// log and the user directory.
    pub fn new<S>(config: ServerConfig, verifier: Arc<dyn CredentialVerifier>, store: Arc<S>) -> Self
    where
        S: MessageStore + UserDirectory + 'static,
    {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new(config.connection_policy));
        let presence = Arc::new(PresenceTracker::new(config.online_threshold));
        let hub = Arc::new(SocketHub::new(config.socket_buffer));
        let messages: Arc<dyn MessageStore> = store.clone();
        let directory: Arc<dyn UserDirectory> = store;

        let lifecycle = Arc::new(ConnectionLifecycle::new(
            registry.clone(),
            presence.clone(),
            verifier.clone(),
            hub.clone(),
            directory.clone(),
            config.verify_timeout,
        ));
        let router = Arc::new(DeliveryRouter::new(
            messages.clone(),
            registry.clone(),
            hub.clone(),
            config.push_timeout,
            config.store_timeout,
        ));

        Self {
            config,
            registry,
            presence,
            verifier,
            hub,
            lifecycle,
            router,
            messages,
            directory,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/send-message", post(send_message))
        .route("/message/:conversation_id", get(get_messages))
        .route("/active", post(mark_active))
        .route("/user", get(list_users))
        .route("/me", get(me))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Authentication ───

/// The verified caller of a request, from `Authorization: Bearer <jwt>`.
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
        if token.is_empty() {
            return Err(IdentityError::MissingCredential.into());
        }

        let identity =
            verify_within(state.verifier.as_ref(), token, state.config.verify_timeout).await?;
        Ok(AuthUser(identity))
    }
}

// ─── Extractors ───
//
// axum's own extractors answer malformed input with a plain-text body; these
// wrappers turn the rejection into a `ServerError` instead.

pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = axum::extract::rejection::JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = axum::extract::rejection::QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    Path<T>: FromRequestParts<S, Rejection = axum::extract::rejection::PathRejection>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

// ─── Responses ───

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
    sockets: usize,
    sessions: usize,
    tracked_users: usize,
    heartbeat_interval_secs: u64,
}

#[derive(Serialize)]
struct SendMessageResponse {
    message: Message,
    delivery: DeliveryOutcome,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceView {
    user_id: UserId,
    email: Option<String>,
    /// Heartbeat-based, for presence indicators.
    online: bool,
    last_active_at: Option<DateTime<Utc>>,
    /// Holds at least one live connection right now.
    connected: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionView {
    connection_id: ConnectionId,
    established_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    #[serde(flatten)]
    presence: PresenceView,
    connections: Vec<ConnectionView>,
    token_expires_at: DateTime<Utc>,
}

// ─── Requests ───

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    #[serde(default)]
    text: String,
    /// Older clients send the image URI as `image`.
    #[serde(default, alias = "image")]
    attachment: Option<String>,
    receiver_id: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Deserialize)]
struct UserListQuery {
    #[serde(default)]
    online: bool,
}

// ─── Handlers ───

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.registry.connection_count(),
        sockets: state.hub.attached(),
        sessions: state.lifecycle.open_sessions(),
        tracked_users: state.presence.tracked_users(),
        heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
    })
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ServerError> {
    let receiver_id = UserId::new(req.receiver_id)?;
    let outgoing = OutgoingMessage::new(
        caller.subject_id.clone(),
        receiver_id,
        req.text,
        req.attachment,
    );

    if let Some(given) = req.conversation_id.filter(|c| !c.is_empty()) {
        let expected = outgoing.conversation_id();
        if given != expected.as_str() {
            return Err(SharedError::ConversationMismatch {
                given,
                expected: expected.to_string(),
            }
            .into());
        }
    }

    let origin = origin_connection(&headers, &state.registry, &caller.subject_id);
    let (message, delivery) = state.router.route(outgoing, origin.as_ref()).await?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse { message, delivery }),
    ))
}

/// The origin connection named by the request, if the caller owns it.
fn origin_connection(
    headers: &HeaderMap,
    registry: &ConnectionRegistry,
    caller: &UserId,
) -> Option<ConnectionId> {
    let id = headers
        .get(ORIGIN_CONNECTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ConnectionId::from)?;
    (registry.owner(&id).as_ref() == Some(caller)).then_some(id)
}

async fn get_messages(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiPath(conversation_id): ApiPath<String>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let conversation_id = ConversationId::from_raw(conversation_id);
    if !conversation_id.involves(&caller.subject_id) {
        return Err(ServerError::Forbidden(
            "not a participant of this conversation".into(),
        ));
    }

    let messages = state.messages.query(&conversation_id).await?;
    Ok(Json(messages))
}

async fn mark_active(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Json<PresenceView> {
    let now = Utc::now();
    state.presence.heartbeat(&caller.subject_id, now);

    if let Err(e) = state
        .directory
        .remember(&caller.subject_id, caller.email.as_deref(), now)
        .await
    {
        warn!(user = %caller.subject_id, error = %e, "Failed to record user in directory");
    }

    Json(presence_view(&state, caller.subject_id, caller.email, now))
}

async fn list_users(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ApiQuery(query): ApiQuery<UserListQuery>,
) -> Result<Json<Vec<PresenceView>>, ServerError> {
    let now = Utc::now();
    let users = state.directory.all_users().await?;

    let candidates: Vec<UserId> = users.iter().map(|u| u.user_id.clone()).collect();
    let online = state
        .presence
        .list_online(&candidates, now, Some(&caller.subject_id));

    let views = users
        .into_iter()
        .filter(|u| u.user_id != caller.subject_id)
        .filter(|u| !query.online || online.contains(&u.user_id))
        .map(|u| presence_view(&state, u.user_id, u.email, now))
        .collect();

    Ok(Json(views))
}

async fn me(State(state): State<AppState>, AuthUser(caller): AuthUser) -> Json<MeResponse> {
    let connections = state
        .registry
        .records(&caller.subject_id)
        .into_iter()
        .map(|record| ConnectionView {
            connection_id: record.connection_id,
            established_at: record.established_at,
        })
        .collect();
    let presence = presence_view(&state, caller.subject_id, caller.email, Utc::now());
    Json(MeResponse {
        presence,
        connections,
        token_expires_at: caller.expiry,
    })
}

fn presence_view(
    state: &AppState,
    user_id: UserId,
    email: Option<String>,
    now: DateTime<Utc>,
) -> PresenceView {
    PresenceView {
        online: state.presence.is_online(&user_id, now),
        last_active_at: state.presence.last_active(&user_id),
        connected: state.registry.is_reachable(&user_id),
        user_id,
        email,
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
