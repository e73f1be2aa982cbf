//! User storage.
//!
//! Account rows live in the shared SQLite store. Authentication enforces the
//! login-lockout policy: consecutive failed attempts increment a counter and
//! lock the account for the configured duration once the threshold is hit.

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::models::{User, UserRole};
use crate::clock::Clock;
use crate::config::ConfigSnapshot;
use crate::db::Db;
use crate::error::{MarketError, Result};

const USER_COLUMNS: &str = "user_id, username, email, password_hash, role, balance_bdt,
    failed_login_attempts, locked_until, suspended, leverage_max, created_at";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role_str: String = row.get(4)?;
    Ok(User {
        user_id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: UserRole::from_str(&role_str).unwrap_or(UserRole::Viewer),
        balance_bdt: row.get(5)?,
        failed_login_attempts: row.get(6)?,
        locked_until: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)),
        suspended: row.get::<_, i64>(8)? != 0,
        leverage_max: row.get(9)?,
        created_at: row
            .get::<_, String>(10)?
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn get_by_email(tx: &Transaction<'_>, email: &str) -> Result<Option<User>> {
    Ok(tx
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            [email],
            row_to_user,
        )
        .optional()?)
}

#[derive(Clone)]
pub struct UserStore {
    db: Db,
    clock: Clock,
}

impl UserStore {
    pub fn new(db: Db, clock: Clock) -> Self {
        Self { db, clock }
    }

    /// Create a user. Username/email collisions surface as `CONFLICT`.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: UserRole,
    ) -> Result<User> {
        let password_hash = hash(password, DEFAULT_COST)
            .map_err(|e| MarketError::Internal(anyhow::Error::from(e)))?;
        let user = User {
            user_id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            role,
            balance_bdt: 0,
            failed_login_attempts: 0,
            locked_until: None,
            suspended: false,
            leverage_max: 50.0,
            created_at: self.clock.now(),
        };

        let inserted = user.clone();
        self.db
            .with_tx(move |tx| {
                let result = tx.execute(
                    "INSERT INTO users (user_id, username, email, password_hash, role,
                        balance_bdt, leverage_max, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)",
                    params![
                        inserted.user_id.to_string(),
                        inserted.username,
                        inserted.email,
                        inserted.password_hash,
                        inserted.role.as_str(),
                        inserted.leverage_max,
                        inserted.created_at.to_rfc3339(),
                    ],
                );
                match result {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Err(MarketError::Conflict("username or email already registered".into()))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        info!(username = %user.username, role = user.role.as_str(), "✅ Created user");
        Ok(user)
    }

    pub async fn get_by_id(&self, user_id: Uuid) -> Result<User> {
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                    [user_id.to_string()],
                    row_to_user,
                )
                .optional()?
                .ok_or_else(|| MarketError::NotFound("user".into()))
            })
            .await
    }

    /// Verify credentials under the lockout policy.
    ///
    /// A wrong password increments the failure counter and, at the threshold,
    /// locks the account; a correct password while unlocked resets it.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
        cfg: &ConfigSnapshot,
    ) -> Result<User> {
        let email = email.to_string();
        let password = password.to_string();
        let now = self.clock.now();
        let max_attempts = cfg.max_login_attempts;
        let lockout = Duration::minutes(cfg.lockout_duration_minutes);

        self.db
            .with_tx(move |tx| {
                let user = get_by_email(tx, &email)?
                    .ok_or_else(|| MarketError::Authentication("invalid credentials".into()))?;

                if user.suspended {
                    return Err(MarketError::Authorization("account suspended".into()));
                }

                if let Some(until) = user.locked_until {
                    if until > now {
                        warn!(email = %email, "🔒 Login attempt on locked account");
                        return Err(MarketError::Authentication(format!(
                            "account locked until {}",
                            until.to_rfc3339()
                        )));
                    }
                }

                let valid = verify(&password, &user.password_hash)
                    .map_err(|e| MarketError::Internal(anyhow::Error::from(e)))?;

                if !valid {
                    let attempts = user.failed_login_attempts + 1;
                    let lock_from_now =
                        (attempts >= max_attempts).then(|| (now + lockout).to_rfc3339());
                    tx.execute(
                        "UPDATE users SET failed_login_attempts = ?1,
                                locked_until = COALESCE(?2, locked_until),
                                updated_at = ?3
                         WHERE user_id = ?4",
                        params![attempts, lock_from_now, now.to_rfc3339(), user.user_id.to_string()],
                    )?;
                    if attempts >= max_attempts {
                        warn!(email = %email, attempts, "🔒 Account locked after failed logins");
                    }
                    return Err(MarketError::Authentication("invalid credentials".into()));
                }

                // Success clears the counter and any stale lock.
                tx.execute(
                    "UPDATE users SET failed_login_attempts = 0, locked_until = NULL,
                            updated_at = ?1
                     WHERE user_id = ?2",
                    params![now.to_rfc3339(), user.user_id.to_string()],
                )?;

                Ok(User { failed_login_attempts: 0, locked_until: None, ..user })
            })
            .await
    }

    pub async fn set_suspended(&self, user_id: Uuid, suspended: bool) -> Result<()> {
        let now = self.clock.now();
        self.db
            .with_tx(move |tx| {
                let updated = tx.execute(
                    "UPDATE users SET suspended = ?1, updated_at = ?2 WHERE user_id = ?3",
                    params![suspended as i64, now.to_rfc3339(), user_id.to_string()],
                )?;
                if updated == 0 {
                    return Err(MarketError::NotFound("user".into()));
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ConfigSnapshot {
        let mut cfg = ConfigSnapshot::default();
        cfg.max_login_attempts = 3;
        cfg.lockout_duration_minutes = 15;
        cfg
    }

    async fn setup() -> (UserStore, User) {
        let db = Db::open_in_memory().unwrap();
        let store = UserStore::new(db, Clock::new());
        let user = store
            .create_user("alice", "alice@example.com", "correct-horse-battery", UserRole::Trader)
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let (store, _) = setup().await;
        let err = store
            .create_user("alice", "other@example.com", "pw-long-enough", UserRole::Trader)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_authenticate_success_and_failure() {
        let (store, user) = setup().await;
        let cfg = test_config();

        let ok = store
            .authenticate("alice@example.com", "correct-horse-battery", &cfg)
            .await
            .unwrap();
        assert_eq!(ok.user_id, user.user_id);

        let err = store.authenticate("alice@example.com", "wrong", &cfg).await.unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_ERROR");
    }

    #[tokio::test]
    async fn test_lockout_after_threshold() {
        let (store, _) = setup().await;
        let cfg = test_config();

        for _ in 0..3 {
            let _ = store.authenticate("alice@example.com", "wrong", &cfg).await;
        }

        // Correct password is now refused: account is locked.
        let err = store
            .authenticate("alice@example.com", "correct-horse-battery", &cfg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("locked"));
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (store, _) = setup().await;
        let cfg = test_config();

        let _ = store.authenticate("alice@example.com", "wrong", &cfg).await;
        let _ = store.authenticate("alice@example.com", "wrong", &cfg).await;
        store
            .authenticate("alice@example.com", "correct-horse-battery", &cfg)
            .await
            .unwrap();

        // Two more failures must not lock (counter was reset).
        let _ = store.authenticate("alice@example.com", "wrong", &cfg).await;
        let _ = store.authenticate("alice@example.com", "wrong", &cfg).await;
        store
            .authenticate("alice@example.com", "correct-horse-battery", &cfg)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_suspended_account_forbidden() {
        let (store, user) = setup().await;
        store.set_suspended(user.user_id, true).await.unwrap();
        let err = store
            .authenticate("alice@example.com", "correct-horse-battery", &test_config())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTHORIZATION_ERROR");
    }
}
