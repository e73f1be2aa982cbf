//! JWT token handling.

use crate::auth::models::{Claims, User};
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;
use uuid::Uuid;

/// Generates and validates access/refresh tokens.
pub struct JwtHandler {
    secret: String,
    access_minutes: i64,
    refresh_days: i64,
}

impl JwtHandler {
    pub fn new(secret: String, access_minutes: i64, refresh_days: i64) -> Self {
        Self { secret, access_minutes, refresh_days }
    }

    fn encode_claims(&self, user: &User, session_id: Uuid, lifetime_secs: i64) -> Result<String> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::seconds(lifetime_secs))
            .context("invalid expiry timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: user.user_id.to_string(),
            username: user.username.clone(),
            role: user.role,
            session_id: session_id.to_string(),
            exp,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("failed to encode JWT")
    }

    /// Access token. Returns `(token, expires_in_seconds)`.
    pub fn generate_access_token(&self, user: &User, session_id: Uuid) -> Result<(String, usize)> {
        let lifetime = self.access_minutes * 60;
        debug!(user = %user.username, "Generating access token, expires in {}m", self.access_minutes);
        Ok((self.encode_claims(user, session_id, lifetime)?, lifetime as usize))
    }

    /// Refresh token with the long expiry.
    pub fn generate_refresh_token(&self, user: &User, session_id: Uuid) -> Result<String> {
        let lifetime = self.refresh_days * 24 * 3600;
        self.encode_claims(user, session_id, lifetime)
    }

    /// Validate a token and extract its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("invalid or expired token")?;
        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::UserRole;

    fn create_test_user() -> User {
        User {
            user_id: Uuid::new_v4(),
            username: "testuser".to_string(),
            email: "test@example.com".to_string(),
            password_hash: "hash".to_string(),
            role: UserRole::Trader,
            balance_bdt: 0,
            failed_login_attempts: 0,
            locked_until: None,
            suspended: false,
            leverage_max: 50.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_generation_and_validation() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string(), 60, 7);
        let user = create_test_user();
        let session = Uuid::new_v4();

        let (token, expires_in) = handler.generate_access_token(&user, session).unwrap();
        assert!(!token.is_empty());
        assert_eq!(expires_in, 3600);

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, user.user_id.to_string());
        assert_eq!(claims.session_id, session.to_string());
        assert_eq!(claims.role, UserRole::Trader);
    }

    #[test]
    fn test_invalid_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string(), 60, 7);
        assert!(handler.validate_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_different_secrets_reject() {
        let handler1 = JwtHandler::new("secret1".to_string(), 60, 7);
        let handler2 = JwtHandler::new("secret2".to_string(), 60, 7);
        let user = create_test_user();

        let (token, _) = handler1.generate_access_token(&user, Uuid::new_v4()).unwrap();
        assert!(handler2.validate_token(&token).is_err());
    }

    #[test]
    fn test_refresh_outlives_access() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string(), 60, 7);
        let user = create_test_user();
        let session = Uuid::new_v4();

        let (access, _) = handler.generate_access_token(&user, session).unwrap();
        let refresh = handler.generate_refresh_token(&user, session).unwrap();

        let access_exp = handler.validate_token(&access).unwrap().exp;
        let refresh_exp = handler.validate_token(&refresh).unwrap().exp;
        assert!(refresh_exp > access_exp);
    }
}
