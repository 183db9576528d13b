use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::ApiContext;
use shared::{
    domain::{MessageId, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{GroupDetail, GroupSummary, MembershipInfo, MessagePage, RelayAck, RelayBatch},
};
use storage::Storage;
use tracing::{error, info};

mod auth;
mod config;
mod registry;
mod ws;

use auth::{bearer_token, mint_token, verify_token, AuthConfig};
use config::{load_settings, prepare_database_url};
use registry::ChannelRegistry;

pub struct AppState {
    pub api: ApiContext,
    pub auth: AuthConfig,
    pub registry: ChannelRegistry,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    groupchat_name: Option<String>,
    #[serde(default)]
    member_emails: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateGroupRequest {
    #[serde(default)]
    groupchat_name: Option<String>,
    #[serde(default)]
    is_private: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    #[serde(default)]
    role: Option<Role>,
}

#[derive(Debug, Deserialize)]
struct NicknameRequest {
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupListQuery {
    #[serde(default)]
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    before: Option<i64>,
    #[serde(default)]
    body: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext { storage },
        auth: AuthConfig {
            secret: settings.jwt_secret,
            ttl_seconds: settings.jwt_ttl_seconds,
        },
        registry: ChannelRegistry::new(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "chat server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/chat-group/", get(http_list_groups).post(http_create_group))
        .route(
            "/chat-group/:group_slug/",
            get(http_group_detail).put(http_update_group),
        )
        .route("/chat-group/:group_slug/membership", post(http_join_group))
        .route("/chat-group/:group_slug/read", post(http_mark_read))
        .route("/chat-group/:group_slug/messages/", get(http_list_messages))
        .route("/membership/:group_slug/", put(http_update_nickname))
        .route("/ably-webhook-message/", post(http_relay_webhook))
        .route("/ws/chat/:group_slug", get(ws::ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Identity-collaborator stand-in: resolves an email to a user and issues a
/// bearer token for it.
async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let email = req.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(error_response(ApiError::validation(
            "a valid email address is required",
        )));
    }

    let user_id = state
        .api
        .storage
        .create_user(email)
        .await
        .map_err(|e| error_response(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    let token = mint_token(&state.auth, user_id, email)
        .map_err(|e| error_response(ApiError::new(ErrorCode::Internal, e.to_string())))?;

    Ok(Json(LoginResponse {
        user_id: user_id.0,
        token,
    }))
}

async fn http_list_groups(
    State(state): State<Arc<AppState>>,
    Query(q): Query<GroupListQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupSummary>>, (StatusCode, Json<ApiError>)> {
    let user_id = authed_user(&state, &headers)?;
    let groups = server_api::list_groups(&state.api, user_id, q.search.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(groups))
}

async fn http_create_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupDetail>), (StatusCode, Json<ApiError>)> {
    let _user_id = authed_user(&state, &headers)?;

    if req.is_private {
        let (detail, reused) =
            server_api::create_or_reuse_private_group(&state.api, &req.member_emails)
                .await
                .map_err(error_response)?;
        let status = if reused {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };
        return Ok((status, Json(detail)));
    }

    let detail = server_api::create_public_group(
        &state.api,
        req.groupchat_name.as_deref(),
        &req.member_emails,
    )
    .await
    .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn http_group_detail(
    State(state): State<Arc<AppState>>,
    Path(group_slug): Path<String>,
    headers: HeaderMap,
) -> Result<Json<GroupDetail>, (StatusCode, Json<ApiError>)> {
    let user_id = authed_user(&state, &headers)?;
    let detail = server_api::group_detail(&state.api, user_id, &group_slug)
        .await
        .map_err(error_response)?;
    Ok(Json(detail))
}

async fn http_update_group(
    State(state): State<Arc<AppState>>,
    Path(group_slug): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<Json<GroupDetail>, (StatusCode, Json<ApiError>)> {
    let user_id = authed_user(&state, &headers)?;
    let detail = server_api::update_group(
        &state.api,
        user_id,
        &group_slug,
        req.groupchat_name.as_deref(),
        req.is_private,
    )
    .await
    .map_err(error_response)?;
    Ok(Json(detail))
}

async fn http_join_group(
    State(state): State<Arc<AppState>>,
    Path(group_slug): Path<String>,
    headers: HeaderMap,
    Json(req): Json<JoinRequest>,
) -> Result<(StatusCode, Json<MembershipInfo>), (StatusCode, Json<ApiError>)> {
    let user_id = authed_user(&state, &headers)?;
    let role = req.role.unwrap_or(Role::Member);
    let membership = server_api::join_group(&state.api, user_id, &group_slug, role)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(membership)))
}

async fn http_update_nickname(
    State(state): State<Arc<AppState>>,
    Path(group_slug): Path<String>,
    headers: HeaderMap,
    Json(req): Json<NicknameRequest>,
) -> Result<Json<MembershipInfo>, (StatusCode, Json<ApiError>)> {
    let user_id = authed_user(&state, &headers)?;
    let membership =
        server_api::update_own_nickname(&state.api, user_id, &group_slug, req.nickname.as_deref())
            .await
            .map_err(error_response)?;
    Ok(Json(membership))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(group_slug): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let user_id = authed_user(&state, &headers)?;
    server_api::mark_read(&state.api, user_id, &group_slug)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(group_slug): Path<String>,
    Query(q): Query<MessagesQuery>,
    headers: HeaderMap,
) -> Result<Json<MessagePage>, (StatusCode, Json<ApiError>)> {
    let user_id = authed_user(&state, &headers)?;
    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    let page = server_api::list_messages(
        &state.api,
        user_id,
        &group_slug,
        limit,
        q.before.map(MessageId),
        q.body.as_deref(),
    )
    .await
    .map_err(error_response)?;
    Ok(Json(page))
}

/// Relay webhook receiver. Malformed JSON rejects the whole batch with 400;
/// everything else acknowledges 200 even when individual events were skipped.
async fn http_relay_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<RelayAck>, (StatusCode, Json<serde_json::Value>)> {
    let batch: RelayBatch = serde_json::from_slice(&body).map_err(|err| {
        error!(%err, "invalid relay webhook payload");
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid JSON"})),
        )
    })?;

    let ack = server_api::ingest_relay_batch(&state.api, &batch)
        .await
        .map_err(|err| {
            error!(error = %err.message, "relay batch processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal Server Error"})),
            )
        })?;
    Ok(Json(ack))
}

fn authed_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserId, (StatusCode, Json<ApiError>)> {
    let token = bearer_token(headers).ok_or_else(|| {
        error_response(ApiError::new(
            ErrorCode::Unauthorized,
            "provide an auth token",
        ))
    })?;
    verify_token(&state.auth, token)
        .ok_or_else(|| error_response(ApiError::new(ErrorCode::Unauthorized, "invalid token")))
}

fn error_response(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
