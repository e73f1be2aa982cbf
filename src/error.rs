//! Error taxonomy and HTTP envelope.
//!
//! One `MarketError` enum covers every kind surfaced to callers. At the API
//! boundary it renders as `{"error": {"code", "message", "details?"}}`; any
//! cause that is not part of the taxonomy collapses to `INTERNAL_ERROR` with
//! the real cause logged, never surfaced.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("{message}")]
    Validation { message: String, details: Option<Value> },

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("insufficient balance: have {available}, need {required}")]
    InsufficientFunds { available: i64, required: i64 },

    #[error("{0}")]
    MarginInsufficient(String),

    #[error("market is not open: {0}")]
    MarketNotOpen(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { limit: u64, retry_after_secs: u64, reset_epoch: i64 },

    #[error("payment required: {required} BDT")]
    PaymentRequired { required: i64, payment_url: Option<String>, gateway: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MarketError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), details: None }
    }

    pub fn validation_with(message: impl Into<String>, details: Value) -> Self {
        Self::Validation { message: message.into(), details: Some(details) }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Authentication(_) => "AUTHENTICATION_ERROR",
            Self::Authorization(_) => "AUTHORIZATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::MarginInsufficient(_) => "MARGIN_INSUFFICIENT",
            Self::MarketNotOpen(_) => "MARKET_NOT_OPEN",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::PaymentRequired { .. } => "PAYMENT_REQUIRED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
            Self::MarginInsufficient(_) => StatusCode::BAD_REQUEST,
            Self::MarketNotOpen(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for MarketError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(anyhow::Error::from(e))
    }
}

impl IntoResponse for MarketError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let details = match &self {
            Self::Validation { details, .. } => details.clone(),
            Self::InsufficientFunds { available, required } => {
                Some(json!({ "available": available, "required": required }))
            }
            Self::PaymentRequired { required, payment_url, gateway } => Some(json!({
                "required_amount": required,
                "payment_required": true,
                "gateway": gateway,
                "payment_url": payment_url,
            })),
            Self::RateLimited { limit, retry_after_secs, reset_epoch } => Some(json!({
                "limit": limit,
                "retry_after_seconds": retry_after_secs,
                "reset": reset_epoch,
            })),
            _ => None,
        };

        // Internal causes are logged with their chain, then masked.
        let message = match &self {
            Self::Internal(cause) => {
                error!("internal error: {cause:#}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({ "error": { "code": code, "message": message } });
        if let Some(details) = details {
            body["error"]["details"] = details;
        }

        let mut response = (status, Json(body)).into_response();

        match &self {
            Self::Authentication(_) => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static("Bearer"));
            }
            Self::RateLimited { limit, retry_after_secs, reset_epoch } => {
                let headers = response.headers_mut();
                if let Ok(v) = header::HeaderValue::from_str(&limit.to_string()) {
                    headers.insert("X-RateLimit-Limit", v);
                }
                headers.insert("X-RateLimit-Remaining", header::HeaderValue::from_static("0"));
                if let Ok(v) = header::HeaderValue::from_str(&reset_epoch.to_string()) {
                    headers.insert("X-RateLimit-Reset", v);
                }
                if let Ok(v) = header::HeaderValue::from_str(&retry_after_secs.to_string()) {
                    headers.insert(header::RETRY_AFTER, v);
                }
            }
            _ => {}
        }

        response
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;
