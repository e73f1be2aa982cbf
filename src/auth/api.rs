//! Authentication endpoints.
//!
//! Registration validates the password against the policy snapshot; login
//! enforces the lockout policy and rotates the single active session.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::jwt::JwtHandler;
use crate::auth::middleware::Authed;
use crate::auth::models::{
    LoginRequest, LoginResponse, RegisterRequest, UserResponse, UserRole,
};
use crate::auth::session::SessionStore;
use crate::auth::user_store::UserStore;
use crate::config::{ConfigProvider, ConfigSnapshot};
use crate::error::{MarketError, Result};

/// Shared auth state.
#[derive(Clone)]
pub struct AuthState {
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionStore>,
    pub jwt: Arc<JwtHandler>,
    pub config: Arc<ConfigProvider>,
}

/// Password policy check. Collects per-field problems for the error envelope.
fn validate_password(password: &str, cfg: &ConfigSnapshot) -> Result<()> {
    let mut problems = Vec::new();

    if password.len() < cfg.password_min_length {
        problems.push(format!("must be at least {} characters", cfg.password_min_length));
    }
    if cfg.password_require_classes {
        if !password.chars().any(|c| c.is_ascii_uppercase()) {
            problems.push("must contain an uppercase letter".to_string());
        }
        if !password.chars().any(|c| c.is_ascii_lowercase()) {
            problems.push("must contain a lowercase letter".to_string());
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            problems.push("must contain a digit".to_string());
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(MarketError::validation_with(
            "password does not meet the policy",
            json!({ "password": problems }),
        ))
    }
}

fn validate_register(payload: &RegisterRequest, cfg: &ConfigSnapshot) -> Result<()> {
    if payload.username.trim().len() < 3 {
        return Err(MarketError::validation_with(
            "invalid registration payload",
            json!({ "username": ["must be at least 3 characters"] }),
        ));
    }
    if !payload.email.contains('@') {
        return Err(MarketError::validation_with(
            "invalid registration payload",
            json!({ "email": ["must be a valid email address"] }),
        ));
    }
    validate_password(&payload.password, cfg)
}

/// POST /auth/register
pub async fn register(
    State(state): State<AuthState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>)> {
    let cfg = state.config.snapshot();
    validate_register(&payload, &cfg)?;

    let user = state
        .users
        .create_user(&payload.username, &payload.email, &payload.password, UserRole::Trader)
        .await?;

    Ok((StatusCode::CREATED, Json(UserResponse::from_user(&user))))
}

/// POST /auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let cfg = state.config.snapshot();
    info!(email = %payload.email, "🔐 Login attempt");

    let user = match state.users.authenticate(&payload.email, &payload.password, &cfg).await {
        Ok(user) => user,
        Err(e) => {
            warn!(email = %payload.email, "❌ Failed login attempt");
            return Err(e);
        }
    };

    // Newest login wins: rotate the session id.
    let session_id = Uuid::new_v4();
    let expires_at = Utc::now().timestamp() + cfg.refresh_token_expire_days * 24 * 3600;
    let previous_session_terminated =
        state.sessions.register(user.user_id, session_id, expires_at).await?;

    let (access_token, expires_in) = state
        .jwt
        .generate_access_token(&user, session_id)
        .map_err(MarketError::Internal)?;
    let refresh_token = state
        .jwt
        .generate_refresh_token(&user, session_id)
        .map_err(MarketError::Internal)?;

    info!(username = %user.username, role = user.role.as_str(), "✅ Login successful");

    Ok(Json(LoginResponse {
        access_token,
        refresh_token,
        token_type: "Bearer",
        expires_in,
        previous_session_terminated,
        user: UserResponse::from_user(&user),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// POST /auth/refresh: trade a refresh token for a fresh access token.
/// The session claim must still be the newest one.
pub async fn refresh(
    State(state): State<AuthState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<LoginResponse>> {
    let claims = state
        .jwt
        .validate_token(&payload.refresh_token)
        .map_err(|_| MarketError::Authentication("invalid or expired refresh token".into()))?;

    let user_id = claims
        .user_id()
        .ok_or_else(|| MarketError::Authentication("malformed subject claim".into()))?;

    if !state.sessions.is_current(user_id, &claims.session_id).await? {
        return Err(MarketError::Authentication("logged out elsewhere".into()));
    }

    let user = state.users.get_by_id(user_id).await?;
    let session_id = Uuid::parse_str(&claims.session_id)
        .map_err(|_| MarketError::Authentication("malformed session claim".into()))?;

    let (access_token, expires_in) = state
        .jwt
        .generate_access_token(&user, session_id)
        .map_err(MarketError::Internal)?;

    Ok(Json(LoginResponse {
        access_token,
        refresh_token: payload.refresh_token,
        token_type: "Bearer",
        expires_in,
        previous_session_terminated: false,
        user: UserResponse::from_user(&user),
    }))
}

/// GET /auth/me
pub async fn me(
    State(state): State<AuthState>,
    Authed(claims): Authed,
) -> Result<Json<UserResponse>> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| MarketError::Authentication("malformed subject claim".into()))?;
    let user = state.users.get_by_id(user_id).await?;
    Ok(Json(UserResponse::from_user(&user)))
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<AuthState>,
    Authed(claims): Authed,
) -> Result<StatusCode> {
    if let Some(user_id) = claims.user_id() {
        state.sessions.revoke(user_id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}
