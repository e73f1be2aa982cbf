//! Authentication middleware and extractors.
//!
//! One middleware resolves the request's auth context (token extraction,
//! JWT validation, single-session check) and stashes an `AuthOutcome` in
//! the request extensions; the `Authed` / `AdminOnly` extractors turn that
//! into the right 401/403 at the handlers that need it. A token from a
//! superseded login surfaces as "logged out elsewhere".

use axum::{
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::jwt::JwtHandler;
use crate::auth::models::{Claims, UserRole};
use crate::auth::session::SessionStore;
use crate::error::MarketError;

#[derive(Clone)]
pub struct AuthLayerState {
    pub jwt: Arc<JwtHandler>,
    pub sessions: Arc<SessionStore>,
}

/// Resolved auth context for one request.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Valid(Claims),
    Invalid(String),
    Missing,
}

fn extract_token(req: &Request<Body>) -> Option<String> {
    // Query parameter first (WebSocket upgrades cannot set headers):
    // /ws/marketdata?token=...
    let from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    });

    let from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    from_query.or(from_header)
}

/// Resolve the auth context and continue. Never rejects by itself; the
/// extractors decide per route.
pub async fn auth_context_middleware(
    State(state): State<AuthLayerState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let outcome = match extract_token(&req) {
        None => AuthOutcome::Missing,
        Some(token) => match state.jwt.validate_token(&token) {
            Err(_) => AuthOutcome::Invalid("invalid or expired token".into()),
            Ok(claims) => match claims.user_id() {
                None => AuthOutcome::Invalid("malformed subject claim".into()),
                Some(user_id) => {
                    match state.sessions.is_current(user_id, &claims.session_id).await {
                        Ok(true) => AuthOutcome::Valid(claims),
                        Ok(false) => AuthOutcome::Invalid("logged out elsewhere".into()),
                        Err(_) => AuthOutcome::Invalid("session check failed".into()),
                    }
                }
            },
        },
    };

    if let AuthOutcome::Valid(claims) = &outcome {
        req.extensions_mut().insert(claims.clone());
    }
    req.extensions_mut().insert(outcome);
    next.run(req).await
}

/// Extractor for authenticated routes.
#[derive(Debug)]
pub struct Authed(pub Claims);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Authed {
    type Rejection = MarketError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<AuthOutcome>() {
            Some(AuthOutcome::Valid(claims)) => Ok(Authed(claims.clone())),
            Some(AuthOutcome::Invalid(reason)) => {
                Err(MarketError::Authentication(reason.clone()))
            }
            Some(AuthOutcome::Missing) | None => {
                Err(MarketError::Authentication("missing authorization token".into()))
            }
        }
    }
}

/// Extractor for admin-only routes.
pub struct AdminOnly(pub Claims);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AdminOnly {
    type Rejection = MarketError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Authed(claims) = Authed::from_request_parts(parts, state).await?;
        if claims.role != UserRole::Admin {
            return Err(MarketError::Authorization("admin role required".into()));
        }
        Ok(AdminOnly(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    #[test]
    fn test_extract_token_from_header() {
        let req = HttpRequest::builder()
            .uri("/orders")
            .header("Authorization", "Bearer abc.def.ghi")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_extract_token_from_query() {
        let req = HttpRequest::builder()
            .uri("/ws/marketdata?token=tok123&x=1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_query_wins_over_header() {
        let req = HttpRequest::builder()
            .uri("/ws/marketdata?token=from-query")
            .header("Authorization", "Bearer from-header")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("from-query"));
    }

    #[test]
    fn test_missing_token() {
        let req = HttpRequest::builder().uri("/orders").body(Body::empty()).unwrap();
        assert!(extract_token(&req).is_none());
    }

    #[tokio::test]
    async fn test_authed_extractor_outcomes() {
        use crate::auth::models::UserRole;
        let claims = Claims {
            sub: uuid::Uuid::new_v4().to_string(),
            username: "u".into(),
            role: UserRole::Trader,
            session_id: uuid::Uuid::new_v4().to_string(),
            exp: 0,
        };

        let mut parts = HttpRequest::builder()
            .uri("/x")
            .body(Body::empty())
            .unwrap()
            .into_parts()
            .0;
        parts.extensions.insert(AuthOutcome::Valid(claims.clone()));
        assert!(Authed::from_request_parts(&mut parts, &()).await.is_ok());
        // Trader is not admin.
        assert!(AdminOnly::from_request_parts(&mut parts, &()).await.is_err());

        let mut parts = HttpRequest::builder()
            .uri("/x")
            .body(Body::empty())
            .unwrap()
            .into_parts()
            .0;
        parts
            .extensions
            .insert(AuthOutcome::Invalid("logged out elsewhere".into()));
        let err = Authed::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert!(err.to_string().contains("logged out elsewhere"));
    }
}
