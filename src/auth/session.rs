//! Single-active-session store.
//!
//! One row per user: `user_id -> (session_id, expires_at)`. A new login
//! overwrites the previous row, so every older token's `session_id` claim
//! stops matching and the request fails with "logged out elsewhere".

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;

#[derive(Clone)]
pub struct SessionStore {
    db: Db,
}

impl SessionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Register the newest session for a user. Returns true when a live
    /// previous session was replaced.
    pub async fn register(&self, user_id: Uuid, session_id: Uuid, expires_at: i64) -> Result<bool> {
        self.db
            .with_tx(move |tx| {
                let now = Utc::now().timestamp();
                let previous: Option<i64> = tx
                    .query_row(
                        "SELECT expires_at FROM sessions WHERE user_id = ?1",
                        [user_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let replaced_live = previous.map(|exp| exp > now).unwrap_or(false);

                tx.execute(
                    "INSERT INTO sessions (user_id, session_id, expires_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (user_id) DO UPDATE SET
                        session_id = excluded.session_id,
                        expires_at = excluded.expires_at",
                    params![user_id.to_string(), session_id.to_string(), expires_at],
                )?;
                Ok(replaced_live)
            })
            .await
    }

    /// Whether `session_id` is the user's newest, unexpired session.
    pub async fn is_current(&self, user_id: Uuid, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.db
            .with_conn(move |conn| {
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT session_id, expires_at FROM sessions WHERE user_id = ?1",
                        [user_id.to_string()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let now = Utc::now().timestamp();
                Ok(row.map(|(sid, exp)| sid == session_id && exp > now).unwrap_or(false))
            })
            .await
    }

    /// Drop a user's session (logout).
    pub async fn revoke(&self, user_id: Uuid) -> Result<()> {
        self.db
            .with_tx(move |tx| {
                tx.execute("DELETE FROM sessions WHERE user_id = ?1", [user_id.to_string()])?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_newest_login_wins() {
        let db = Db::open_in_memory().unwrap();
        let store = SessionStore::new(db);
        let user = Uuid::new_v4();
        let future = Utc::now().timestamp() + 3600;

        let first = Uuid::new_v4();
        assert!(!store.register(user, first, future).await.unwrap());
        assert!(store.is_current(user, &first.to_string()).await.unwrap());

        let second = Uuid::new_v4();
        assert!(store.register(user, second, future).await.unwrap());
        assert!(!store.is_current(user, &first.to_string()).await.unwrap());
        assert!(store.is_current(user, &second.to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_session_not_current() {
        let db = Db::open_in_memory().unwrap();
        let store = SessionStore::new(db);
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();

        store.register(user, session, Utc::now().timestamp() - 10).await.unwrap();
        assert!(!store.is_current(user, &session.to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke() {
        let db = Db::open_in_memory().unwrap();
        let store = SessionStore::new(db);
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();

        store.register(user, session, Utc::now().timestamp() + 3600).await.unwrap();
        store.revoke(user).await.unwrap();
        assert!(!store.is_current(user, &session.to_string()).await.unwrap());
    }
}
