//! HTTP and WebSocket handlers for the Wisp API.
//!
//! Handlers stay thin: extract and validate, call the service, map the
//! result. Every mutating call requires an opaque `X-Device-ID` header.
//! No ciphertext and no full identifiers are ever logged.

use crate::apns::{create_bridge, ApnsBridge};
use crate::cache::Cache;
use crate::config::Config;
use crate::conversations::Conversations;
use crate::devices::Devices;
use crate::error::ApiError;
use crate::files::FileStaging;
use crate::hub::{ClientFrame, Hub};
use crate::messages::{MessagePayload, Messages};
use crate::models::*;
use crate::queue::MessageQueue;
use crate::store::Store;
use crate::tier::{FreeTierGate, SubscriptionGate};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum request body size (16 MiB; covers a premium payload after base64
/// inflation).
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Requests slower than this are logged at warn.
const SLOW_REQUEST: std::time::Duration = std::time::Duration::from_secs(1);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub cache: Arc<Cache>,
    pub hub: Arc<Hub>,
    pub apns: Arc<ApnsBridge>,
    pub queue: MessageQueue,
    pub conversations: Conversations,
    pub messages: Messages,
    pub devices: Devices,
    pub files: Arc<FileStaging>,
}

impl AppState {
    /// Wire all services over shared store/cache with the default gate.
    pub async fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(Store::new());
        let cache = Arc::new(Cache::new());
        let gate: Arc<dyn SubscriptionGate> = Arc::new(FreeTierGate);
        let hub = Arc::new(Hub::new(config.outbox_capacity));
        let apns = create_bridge(&config, store.clone(), cache.clone()).await;
        let queue = MessageQueue::new(cache.clone());

        let conversations = Conversations::new(
            store.clone(),
            cache.clone(),
            apns.clone(),
            gate.clone(),
            config.clone(),
        );
        let messages = Messages::new(
            store.clone(),
            cache.clone(),
            queue.clone(),
            apns.clone(),
            gate.clone(),
            config.clone(),
        );
        let devices = Devices::new(store.clone(), cache.clone());
        let files = Arc::new(FileStaging::new(
            store.clone(),
            cache.clone(),
            gate,
            config.clone(),
        ));

        Self {
            config,
            store,
            cache,
            hub,
            apns,
            queue,
            conversations,
            messages,
            devices,
            files,
        }
    }
}

/// Extract the opaque device identifier every mutating call must carry.
fn require_device_id(headers: &HeaderMap) -> Result<DeviceId, ApiError> {
    headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .ok_or(ApiError::Validation("missing or invalid X-Device-ID header"))
}

// === Health ===

/// GET /health - readiness probe
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        cache: state.cache.ping(),
    })
}

// === Conversations ===

/// POST /api/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = require_device_id(&headers)?;
    let conversation = state.conversations.create(&device_id, req.ttl_hours).await?;
    Ok((
        StatusCode::CREATED,
        Json(ConversationView::from_entity(&conversation, &device_id)),
    ))
}

/// GET /api/conversations - caller's initiated, active conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationView>>, ApiError> {
    let device_id = require_device_id(&headers)?;
    let conversations = state.conversations.list_for_initiator(&device_id).await;
    Ok(Json(
        conversations
            .iter()
            .map(|c| ConversationView::from_entity(c, &device_id))
            .collect(),
    ))
}

/// GET /api/conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationView>, ApiError> {
    let device_id = require_device_id(&headers)?;
    let conversation = state
        .conversations
        .get(&id)
        .await
        .ok_or(ApiError::NotFound("conversation not found"))?;
    Ok(Json(ConversationView::from_entity(&conversation, &device_id)))
}

/// DELETE /api/conversations/:id - initiator only
pub async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let device_id = require_device_id(&headers)?;
    state.conversations.delete(&id, &device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/conversations/:id/share
pub async fn share_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ShareLinkResponse>, ApiError> {
    let _device_id = require_device_id(&headers)?;
    if state.conversations.get(&id).await.is_none() {
        return Err(ApiError::NotFound("conversation not found"));
    }
    Ok(Json(ShareLinkResponse {
        share_url: state.conversations.share_url(&id),
    }))
}

/// GET /api/conversations/:id/accessible - liveness probe
pub async fn conversation_accessible(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Json<AccessibleResponse> {
    let accessible = state
        .conversations
        .get(&id)
        .await
        .is_some_and(|c| c.is_live(chrono::Utc::now()));
    Json(AccessibleResponse { accessible })
}

/// POST /api/conversations/:id/join - consume the one-shot share link
pub async fn join_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ParticipantView>, ApiError> {
    let device_id = require_device_id(&headers)?;
    let participant = state.conversations.join(&id, &device_id).await?;
    Ok(Json(ParticipantView::from(&participant)))
}

/// GET /api/conversations/:id/participants
pub async fn list_participants(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ParticipantView>>, ApiError> {
    let participants = state.conversations.participants(&id).await?;
    Ok(Json(participants.iter().map(ParticipantView::from).collect()))
}

/// GET /api/conversations/:id/participants/:device_id/status
pub async fn participant_status(
    State(state): State<AppState>,
    Path((id, device_id)): Path<(Uuid, String)>,
) -> Result<Json<ParticipantStatusResponse>, ApiError> {
    if state.conversations.get(&id).await.is_none() {
        return Err(ApiError::NotFound("conversation not found"));
    }
    let active = state.conversations.is_active_participant(&id, &device_id).await;
    Ok(Json(ParticipantStatusResponse { active }))
}

/// POST /api/conversations/:id/leave - idempotent departure
pub async fn leave_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let device_id = require_device_id(&headers)?;
    state.conversations.leave(&id, &device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Messages ===

/// POST /api/conversations/:id/messages - direct durable create
pub async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = require_device_id(&headers)?;
    let payload = MessagePayload::decode(&req)?;
    let message = state.messages.create_direct(&id, &device_id, payload).await?;
    Ok((StatusCode::CREATED, Json(MessageView::from(&message))))
}

/// POST /api/conversations/:id/messages/buffered - pipeline create
///
/// Returns 202 before durability; the sender resolves the outcome through
/// MESSAGE_DELIVERED / MESSAGE_FAILED on the push channel.
pub async fn create_buffered_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = require_device_id(&headers)?;
    let payload = MessagePayload::decode(&req)?;
    let accepted = state.messages.send_buffered(&id, &device_id, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// GET /api/conversations/:id/messages[?since=] - full or incremental list
pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let messages = match query.since {
        Some(since) => state.messages.list_since(&id, since).await?,
        None => state.messages.list(&id).await?,
    };
    Ok(Json(messages.iter().map(MessageView::from).collect()))
}

/// GET /api/conversations/:id/messages/:message_id - single-shot consume
pub async fn consume_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<MessageView>, ApiError> {
    let message = state.messages.consume(&id, &message_id).await?;
    Ok(Json(MessageView::from(&message)))
}

// === Files ===

/// POST /api/conversations/:id/files - two-phase upload
pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UploadFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = require_device_id(&headers)?;
    let accepted = state.files.upload(&id, &device_id, &req).await?;
    Ok((StatusCode::CREATED, Json(accepted)))
}

/// GET /api/files/:file_id - binary download
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let (binary, message) = state.files.download(&file_id).await?;
    let metadata = message.file.ok_or(ApiError::Internal)?;

    let response = (
        [
            (header::CONTENT_TYPE, metadata.mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", metadata.name),
            ),
        ],
        binary,
    );
    Ok(response.into_response())
}

// === Devices ===

/// POST /api/devices/token - register vendor push token
pub async fn register_device_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterTokenRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let device_id = require_device_id(&headers)?;
    state.devices.register_token(&device_id, &req.token).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /api/devices/logout - remove all tokens for the device
pub async fn logout_device(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let device_id = require_device_id(&headers)?;
    state.devices.logout(&device_id).await;
    Ok(StatusCode::NO_CONTENT)
}

// === Push channel ===

/// GET /ws - bidirectional push channel upgrade.
///
/// The device identifies itself with `X-Device-ID` or a `device_id` query
/// parameter at upgrade time; the user queue subscription is implicit.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let device_id = match require_device_id(&headers) {
        Ok(id) => id,
        Err(_) => params
            .get("device_id")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or(ApiError::Validation("missing device identity"))?,
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(state, device_id, socket)))
}

async fn handle_socket(state: AppState, device_id: DeviceId, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (connection_id, outbox) = state.hub.connect(device_id);
    info!(connection = connection_id, "Push channel socket opened");

    // Writer: pump the bounded outbox into the socket. The outbox closes
    // when the hub drops the connection.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: subscription control frames from the client.
    while let Some(Ok(message)) = stream.next().await {
        match message {
            WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Subscribe { destination }) => {
                    state.hub.subscribe(connection_id, &destination);
                }
                Ok(ClientFrame::Unsubscribe { destination }) => {
                    state.hub.unsubscribe(connection_id, &destination);
                }
                Err(e) => debug!(error = %e, "Ignoring malformed client frame"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.hub.disconnect(connection_id);
    let _ = writer.await;
    info!(connection = connection_id, "Push channel socket closed");
}

// === Router ===

/// Build the Axum router with all endpoints and middleware.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/conversations/:id/share", post(share_conversation))
        .route("/conversations/:id/accessible", get(conversation_accessible))
        .route("/conversations/:id/join", post(join_conversation))
        .route("/conversations/:id/participants", get(list_participants))
        .route(
            "/conversations/:id/participants/:device_id/status",
            get(participant_status),
        )
        .route("/conversations/:id/leave", post(leave_conversation))
        .route("/conversations/:id/messages", post(create_message).get(list_messages))
        .route(
            "/conversations/:id/messages/buffered",
            post(create_buffered_message),
        )
        .route("/conversations/:id/messages/:message_id", get(consume_message))
        .route("/conversations/:id/files", post(upload_file))
        .route("/files/:file_id", get(download_file))
        .route("/devices/token", post(register_device_token))
        .route("/devices/logout", post(logout_device));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .nest("/api", api)
        // Middleware stack (order matters: first added = outermost)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static("x-device-id")]),
        )
        .layer(TraceLayer::new_for_http().on_response(SlowRequestLog))
        .with_state(state)
}

/// Logs any request slower than [`SLOW_REQUEST`] at warn.
#[derive(Debug, Clone, Copy)]
struct SlowRequestLog;

impl<B> tower_http::trace::OnResponse<B> for SlowRequestLog {
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: std::time::Duration,
        _span: &tracing::Span,
    ) {
        if latency > SLOW_REQUEST {
            warn!(
                status = %response.status(),
                latency_ms = latency.as_millis() as u64,
                "Slow request"
            );
        }
    }
}
