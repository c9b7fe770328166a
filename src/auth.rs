// Authentication: password hashing, in-memory session tokens, permission
// checks and the login/logout handlers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{FromRef, FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::api::{json_error, AppState};
use crate::metrics;
use crate::users::UserSummary;

/// Header used by the legacy panel UI instead of `Authorization: Bearer`.
pub const LEGACY_TOKEN_HEADER: &str = "x-auth-token";

// ── Permissions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewConsole,
    SendMessage,
    StartStop,
    ManageUsers,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::ViewConsole,
        Permission::SendMessage,
        Permission::StartStop,
        Permission::ManageUsers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ViewConsole => "view_console",
            Permission::SendMessage => "send_message",
            Permission::StartStop => "start_stop",
            Permission::ManageUsers => "manage_users",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("Unknown permission: {s}"))
    }
}

// ── Password hashing ─────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| format!("Failed to hash password: {e}"))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| format!("Invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

// ── Sessions ─────────────────────────────────────────────────────────

/// What a session token grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub username: String,
    pub role: String,
    pub permissions: BTreeSet<Permission>,
}

impl Session {
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

impl From<&UserSummary> for Session {
    fn from(user: &UserSummary) -> Self {
        Self {
            username: user.username.clone(),
            role: user.role.clone(),
            permissions: user.permissions.clone(),
        }
    }
}

/// In-memory session table. Tokens never expire and are lost on restart.
/// Only SHA-256 digests of tokens are kept.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and return its bearer token.
    pub fn issue(&self, session: Session) -> String {
        let token = hex::encode(generate_random_bytes());
        self.lock().insert(hash_token(&token), session);
        token
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        self.lock().get(&hash_token(token)).cloned()
    }

    /// Drop a single session. Returns whether it existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.lock().remove(&hash_token(token)).is_some()
    }

    /// Drop every session of `username`. Returns how many were removed.
    pub fn revoke_user(&self, username: &str) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.username != username);
        before - sessions.len()
    }

    /// Apply a permission change to every live session of `username`.
    pub fn refresh_permissions(&self, username: &str, permissions: &BTreeSet<Permission>) {
        for session in self.lock().values_mut() {
            if session.username == username {
                session.permissions = permissions.clone();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate_random_bytes() -> [u8; 32] {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

// ── Axum extractor: AuthUser ─────────────────────────────────────────

/// Extracts the authenticated session from `Authorization: Bearer <token>`
/// or the legacy `x-auth-token` header.
/// Usage: `AuthUser(session)` in handler parameters.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub token: String,
    pub session: Session,
}

impl AuthUser {
    /// Reject with 403 unless the session holds `permission`.
    pub fn require(&self, permission: Permission) -> Result<(), Response> {
        if self.session.has(permission) {
            Ok(())
        } else {
            Err(json_error(StatusCode::FORBIDDEN, "No permission").into_response())
        }
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    SessionStore: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let bearer = TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|TypedHeader(auth)| auth.token().to_string());
        let token = bearer.or_else(|| {
            parts
                .headers
                .get(LEGACY_TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });

        let Some(token) = token else {
            return Err(json_error(StatusCode::UNAUTHORIZED, "Not authenticated").into_response());
        };

        let sessions = SessionStore::from_ref(state);
        match sessions.get(&token) {
            Some(session) => Ok(AuthUser { token, session }),
            None => Err(json_error(StatusCode::UNAUTHORIZED, "Not authenticated").into_response()),
        }
    }
}

// ── Auth API handlers ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub ok: bool,
    pub token: String,
    pub username: String,
    pub role: String,
    pub permissions: BTreeSet<Permission>,
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    if let Err(e) = state.login_limiter.check_limit(&req.username) {
        metrics::LOGIN_FAILURES_TOTAL.inc();
        return json_error(StatusCode::TOO_MANY_REQUESTS, &e.to_string()).into_response();
    }

    let user = match state.users.verify_credentials(&req.username, &req.password) {
        Ok(Some(user)) => user,
        Ok(None) => {
            metrics::LOGIN_FAILURES_TOTAL.inc();
            tracing::info!(username = %req.username, "Rejected panel login");
            return json_error(StatusCode::UNAUTHORIZED, "Invalid credentials").into_response();
        }
        Err(e) => {
            tracing::error!("User store error in login: {e}");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                .into_response();
        }
    };
    state.login_limiter.reset(&req.username);

    let session = Session::from(&user);
    let token = state.sessions.issue(session.clone());
    tracing::info!(username = %session.username, "Panel login");

    (
        StatusCode::OK,
        Json(LoginResponse {
            ok: true,
            token,
            username: session.username,
            role: session.role,
            permissions: session.permissions,
        }),
    )
        .into_response()
}

pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> Response {
    state.sessions.revoke(&auth.token);
    (StatusCode::OK, Json(json!({ "ok": true, "message": "Logged out" }))).into_response()
}

pub async fn me(auth: AuthUser) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "user": auth.session })),
    )
        .into_response()
}
