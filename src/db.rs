//! SQLite store handle.
//!
//! One bundled-SQLite connection in WAL mode behind a `tokio::sync::Mutex`,
//! shared by every repository. Row-level write locks are emulated with a
//! per-user async mutex map: `with_user_tx` serializes all balance/holding
//! mutations for one user while letting different users proceed in parallel.
//! Repository functions take the `rusqlite::Transaction` handle so a caller
//! can compose several mutations into one atomic commit.

use anyhow::Context;
use parking_lot::Mutex as SyncMutex;
use rusqlite::{Connection, Transaction};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{MarketError, Result};

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    user_locks: Arc<SyncMutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl Db {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("open database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        init_schema(&conn).context("initialize schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            user_locks: Arc::new(SyncMutex::new(HashMap::new())),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        init_schema(&conn).context("initialize schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            user_locks: Arc::new(SyncMutex::new(HashMap::new())),
        })
    }

    fn user_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock();
        locks.entry(user_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Run `f` inside a transaction, no row lock. Rolls back when `f` errors.
    pub async fn with_tx<R>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` inside a transaction while holding the user's row lock.
    pub async fn with_user_tx<R>(
        &self,
        user_id: Uuid,
        f: impl FnOnce(&Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.with_tx(f).await
    }

    /// Run `f` while holding the row locks of every listed user, acquired
    /// in id order so concurrent multi-user commits can never deadlock.
    /// Used by trade settlement, where one commit touches taker and makers.
    pub async fn with_users_tx<R>(
        &self,
        mut user_ids: Vec<Uuid>,
        f: impl FnOnce(&Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        user_ids.sort();
        user_ids.dedup();
        let locks: Vec<Arc<Mutex<()>>> =
            user_ids.iter().map(|&id| self.user_lock(id)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }
        self.with_tx(f).await
    }

    /// Run `f` while holding both users' row locks, acquired in id order so
    /// two concurrent transfers can never deadlock.
    pub async fn with_two_user_tx<R>(
        &self,
        a: Uuid,
        b: Uuid,
        f: impl FnOnce(&Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        if a == b {
            return Err(MarketError::validation("transfer endpoints must differ"));
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let lock_a = self.user_lock(first);
        let lock_b = self.user_lock(second);
        let _guard_a = lock_a.lock().await;
        let _guard_b = lock_b.lock().await;
        self.with_tx(f).await
    }

    /// Read-only access without a transaction envelope.
    pub async fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R>,
    ) -> Result<R> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Idempotent read with up to three attempts. Only storage-level
    /// failures are retried, with exponential backoff plus jitter; domain
    /// errors surface immediately. Writes never retry: they fail fast and
    /// leave the caller to decide.
    pub async fn with_read_retry<R>(
        &self,
        f: impl Fn(&Connection) -> Result<R>,
    ) -> Result<R> {
        use rand::Rng;

        let mut backoff_ms = 10u64;
        let mut last_err: Option<MarketError> = None;
        for attempt in 0..3 {
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms *= 2;
            }
            let result = {
                let conn = self.conn.lock().await;
                f(&conn)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e @ MarketError::Internal(_)) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| MarketError::Internal(anyhow::anyhow!("read retries exhausted"))))
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            email TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'trader',
            balance_bdt INTEGER NOT NULL DEFAULT 0 CHECK (balance_bdt >= 0),
            failed_login_attempts INTEGER NOT NULL DEFAULT 0,
            locked_until TEXT,
            suspended INTEGER NOT NULL DEFAULT 0,
            account_status TEXT NOT NULL DEFAULT 'active',
            leverage_max REAL NOT NULL DEFAULT 50.0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            user_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS instruments (
            instrument_id TEXT PRIMARY KEY,
            symbol TEXT UNIQUE NOT NULL,
            asset_class TEXT NOT NULL,
            tick_size REAL NOT NULL CHECK (tick_size > 0),
            lot_size REAL NOT NULL CHECK (lot_size > 0),
            leverage_max REAL NOT NULL DEFAULT 1.0 CHECK (leverage_max >= 1.0),
            margin_allowed INTEGER NOT NULL DEFAULT 0,
            short_allowed INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS orders (
            order_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            instrument_id TEXT NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL,
            quantity REAL NOT NULL,
            remaining REAL NOT NULL,
            price REAL,
            stop_price REAL,
            trailing_offset REAL,
            iceberg_visible REAL,
            oco_group_id TEXT,
            time_in_force TEXT NOT NULL,
            status TEXT NOT NULL,
            client_order_id TEXT,
            leverage REAL NOT NULL DEFAULT 1.0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_client_id
            ON orders(user_id, client_order_id)
            WHERE client_order_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_orders_instrument_status
            ON orders(instrument_id, status);

        CREATE TABLE IF NOT EXISTS trades (
            trade_id TEXT PRIMARY KEY,
            instrument_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            buy_order_id TEXT NOT NULL,
            sell_order_id TEXT NOT NULL,
            buyer_id TEXT NOT NULL,
            seller_id TEXT NOT NULL,
            price REAL NOT NULL,
            quantity REAL NOT NULL,
            taker_fee_bdt INTEGER NOT NULL DEFAULT 0,
            maker_fee_bdt INTEGER NOT NULL DEFAULT 0,
            executed_at TEXT NOT NULL,
            UNIQUE (instrument_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_trades_instrument_seq
            ON trades(instrument_id, seq DESC);

        CREATE TABLE IF NOT EXISTS transactions (
            tx_id TEXT PRIMARY KEY,
            buyer_id TEXT NOT NULL,
            seller_id TEXT,
            reference TEXT,
            transaction_type TEXT NOT NULL,
            amount_bdt INTEGER NOT NULL,
            status TEXT NOT NULL,
            platform_fee_bdt INTEGER NOT NULL DEFAULT 0,
            gateway_fee_bdt INTEGER NOT NULL DEFAULT 0,
            gateway_name TEXT,
            gateway_external_id TEXT,
            completed_at TEXT,
            biome TEXT,
            shares REAL,
            price_per_share_bdt REAL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_buyer_created
            ON transactions(buyer_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS biome_markets (
            biome TEXT PRIMARY KEY,
            cash_bdt INTEGER NOT NULL CHECK (cash_bdt >= 0),
            total_shares INTEGER NOT NULL CHECK (total_shares > 0),
            attention REAL NOT NULL DEFAULT 0,
            last_redistribution_at TEXT,
            last_activity_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS biome_holdings (
            user_id TEXT NOT NULL,
            biome TEXT NOT NULL,
            shares REAL NOT NULL DEFAULT 0 CHECK (shares >= 0),
            total_invested_bdt INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, biome)
        );

        CREATE TABLE IF NOT EXISTS attention_scores (
            user_id TEXT NOT NULL,
            biome TEXT NOT NULL,
            score REAL NOT NULL DEFAULT 0 CHECK (score >= 0),
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, biome)
        );

        CREATE TABLE IF NOT EXISTS price_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            biome TEXT NOT NULL,
            price REAL NOT NULL,
            cash_bdt INTEGER NOT NULL,
            attention REAL NOT NULL,
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_price_history_biome_ts
            ON price_history(biome, recorded_at DESC);

        CREATE TABLE IF NOT EXISTS positions (
            position_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            instrument_id TEXT NOT NULL,
            side TEXT NOT NULL,
            quantity REAL NOT NULL,
            entry_price REAL NOT NULL,
            current_price REAL,
            margin_used REAL NOT NULL,
            leverage REAL NOT NULL,
            swap_accrued REAL NOT NULL DEFAULT 0,
            realized_pnl REAL,
            opened_at TEXT NOT NULL,
            closed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_positions_user_open
            ON positions(user_id, closed_at);

        CREATE TABLE IF NOT EXISTS margin_calls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            margin_level REAL NOT NULL,
            equity REAL NOT NULL,
            used_margin REAL NOT NULL,
            action TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS corporate_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            instrument_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            factor REAL NOT NULL CHECK (factor > 0),
            effective_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS market_status (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            status TEXT NOT NULL DEFAULT 'open',
            reason TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS payment_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gateway TEXT NOT NULL,
            external_id TEXT,
            user_id TEXT NOT NULL,
            amount_bdt INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_id TEXT,
            action TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL
        );",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO market_status (id, status, updated_at)
         VALUES (1, 'open', ?1)",
        [chrono::Utc::now().to_rfc3339()],
    )?;

    Ok(())
}
