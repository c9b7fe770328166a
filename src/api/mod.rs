// HTTP API routes (bot control, user management, health and metrics)

pub mod ws;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{FromRef, Json, Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::auth::{self, AuthUser, Permission, SessionStore};
use crate::bot::BotManager;
use crate::metrics;
use crate::rate_limit::RateLimiter;
use crate::users::{is_protected, UserStore, UserStoreError, UserSummary, PROTECTED_USER};

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Deserialize)]
pub struct SetPermissionRequest {
    pub permission: String,
    pub value: bool,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub bot: BotManager,
    pub users: UserStore,
    pub sessions: SessionStore,
    pub login_limiter: RateLimiter,
}

impl AppState {
    pub fn new(bot: BotManager, users: UserStore) -> Self {
        Self {
            bot,
            users,
            sessions: SessionStore::new(),
            login_limiter: RateLimiter::for_logins(),
        }
    }
}

impl FromRef<AppState> for SessionStore {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

// ── Error helper ──────────────────────────────────────────────────────

pub fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "ok": false, "message": msg })))
}

fn store_error(e: UserStoreError) -> Response {
    match e {
        UserStoreError::NotFound => {
            json_error(StatusCode::NOT_FOUND, "User not found").into_response()
        }
        UserStoreError::AlreadyExists => {
            json_error(StatusCode::BAD_REQUEST, "User exists").into_response()
        }
        UserStoreError::Protected(name) => {
            json_error(StatusCode::FORBIDDEN, &format!("Cannot modify {name}")).into_response()
        }
        e => {
            tracing::error!("User store error: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

fn ok_message(msg: &str) -> Response {
    (StatusCode::OK, Json(json!({ "ok": true, "message": msg }))).into_response()
}

// ── Router ────────────────────────────────────────────────────────────

/// Build the full application router. The browser UI is served from
/// `static_dir` for any path no route claims.
pub fn router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Auth
        .route("/api/login", post(auth::login))
        .route("/api/logout", post(auth::logout))
        .route("/api/me", get(auth::me))
        // Bot control
        .route("/api/status", get(bot_status))
        .route("/api/start", post(start_bot))
        .route("/api/stop", post(stop_bot))
        .route("/api/chat", post(send_chat))
        // User management
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/{username}", delete(delete_user))
        .route("/api/users/{username}/permissions", patch(set_permission))
        // Console
        .route("/ws", get(ws::ws_console))
        .with_state(state);

    let app = match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    };

    app.layer(middleware::from_fn(track_metrics))
        .layer(CorsLayer::permissive())
}

/// Record request count and latency per normalized path.
async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, &status])
        .inc();
    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[&endpoint])
        .observe(started.elapsed().as_secs_f64());
    response
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "ok": true, "status": "healthy" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

// ── Bot handlers ──────────────────────────────────────────────────────

async fn bot_status(State(state): State<AppState>) -> impl IntoResponse {
    let bot = &state.bot;
    Json(json!({
        "ok": true,
        "bot": bot.status(),
        "phase": bot.phase(),
        "reconnect_pending": bot.reconnect_pending(),
    }))
}

async fn start_bot(State(state): State<AppState>, auth: AuthUser) -> Response {
    if let Err(resp) = auth.require(Permission::StartStop) {
        return resp;
    }
    tracing::info!(username = %auth.session.username, "Bot start requested");
    state.bot.start();
    ok_message("Bot starting...")
}

async fn stop_bot(State(state): State<AppState>, auth: AuthUser) -> Response {
    if let Err(resp) = auth.require(Permission::StartStop) {
        return resp;
    }
    tracing::info!(username = %auth.session.username, "Bot stop requested");
    state.bot.stop();
    ok_message("Bot stopping...")
}

async fn send_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<ChatRequest>,
) -> Response {
    if let Err(resp) = auth.require(Permission::SendMessage) {
        return resp;
    }
    let ok = state.bot.send_message(&req.message);
    (
        StatusCode::OK,
        Json(json!({ "ok": ok, "message": req.message })),
    )
        .into_response()
}

// ── User handlers ─────────────────────────────────────────────────────

async fn list_users(State(state): State<AppState>, auth: AuthUser) -> Response {
    if let Err(resp) = auth.require(Permission::ManageUsers) {
        return resp;
    }
    let users: BTreeMap<String, UserSummary> = state
        .users
        .list()
        .into_iter()
        .map(|u| (u.username.clone(), u))
        .collect();
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "users": users,
            "currentUserPermissions": auth.session.permissions,
        })),
    )
        .into_response()
}

async fn create_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateUserRequest>,
) -> Response {
    if let Err(resp) = auth.require(Permission::ManageUsers) {
        return resp;
    }
    if req.username.trim().is_empty() || req.password.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "Missing fields").into_response();
    }

    let permissions = match req
        .permissions
        .iter()
        .map(|p| p.parse::<Permission>())
        .collect::<Result<BTreeSet<_>, _>>()
    {
        Ok(p) => p,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e).into_response(),
    };
    let role = req.role.unwrap_or_else(|| "user".to_string());

    match state
        .users
        .create(&req.username, &req.password, &role, permissions)
    {
        Ok(_) => {
            tracing::info!(by = %auth.session.username, username = %req.username, "User added");
            ok_message("User added")
        }
        Err(e) => store_error(e),
    }
}

async fn delete_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(username): Path<String>,
) -> Response {
    if let Err(resp) = auth.require(Permission::ManageUsers) {
        return resp;
    }
    if is_protected(&username) {
        return json_error(
            StatusCode::FORBIDDEN,
            &format!("Cannot delete {PROTECTED_USER}"),
        )
        .into_response();
    }

    match state.users.delete(&username) {
        Ok(()) => {
            let revoked = state.sessions.revoke_user(&username);
            tracing::info!(by = %auth.session.username, %username, revoked, "User deleted");
            ok_message("Deleted")
        }
        Err(e) => store_error(e),
    }
}

async fn set_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(username): Path<String>,
    Json(req): Json<SetPermissionRequest>,
) -> Response {
    if let Err(resp) = auth.require(Permission::ManageUsers) {
        return resp;
    }
    if is_protected(&username) {
        return json_error(
            StatusCode::FORBIDDEN,
            &format!("Cannot modify {PROTECTED_USER} permissions"),
        )
        .into_response();
    }
    let permission = match req.permission.parse::<Permission>() {
        Ok(p) => p,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e).into_response(),
    };

    match state.users.set_permission(&username, permission, req.value) {
        Ok(permissions) => {
            state.sessions.refresh_permissions(&username, &permissions);
            tracing::info!(
                by = %auth.session.username,
                %username,
                %permission,
                value = req.value,
                "Permissions updated"
            );
            ok_message("Permissions updated")
        }
        Err(e) => store_error(e),
    }
}
