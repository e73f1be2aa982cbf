//! Unified transaction ledger.
//!
//! Sole mutator of user balances. Every balance change happens inside one
//! SQLite transaction under the user's row lock and appends an immutable row
//! to the unified `transactions` table. Completed rows are never modified;
//! the only accepted status transitions are pending→completed, pending→failed
//! and completed→refunded.
//!
//! Repository functions take a `rusqlite::Transaction` handle so callers
//! (biome trading, matching engine persistence) can compose a debit with
//! their own writes in the same atomic commit.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::Db;
use crate::error::{MarketError, Result};

/// Type tag of a unified transaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    MarketplaceBuyNow,
    MarketplaceAuction,
    MarketplaceFixedPrice,
    Transfer,
    BiomeBuy,
    BiomeSell,
    Topup,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::MarketplaceBuyNow => "marketplace_buy_now",
            TxType::MarketplaceAuction => "marketplace_auction",
            TxType::MarketplaceFixedPrice => "marketplace_fixed_price",
            TxType::Transfer => "transfer",
            TxType::BiomeBuy => "biome_buy",
            TxType::BiomeSell => "biome_sell",
            TxType::Topup => "topup",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "marketplace_buy_now" => Some(TxType::MarketplaceBuyNow),
            "marketplace_auction" => Some(TxType::MarketplaceAuction),
            "marketplace_fixed_price" => Some(TxType::MarketplaceFixedPrice),
            "transfer" => Some(TxType::Transfer),
            "biome_buy" => Some(TxType::BiomeBuy),
            "biome_sell" => Some(TxType::BiomeSell),
            "topup" => Some(TxType::Topup),
            _ => None,
        }
    }

    /// The `transaction_source` projection of the unified view.
    pub fn source(&self) -> &'static str {
        match self {
            TxType::BiomeBuy | TxType::BiomeSell => "biome",
            TxType::MarketplaceBuyNow
            | TxType::MarketplaceAuction
            | TxType::MarketplaceFixedPrice => "marketplace",
            TxType::Transfer | TxType::Topup => "wallet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Completed => "completed",
            TxStatus::Failed => "failed",
            TxStatus::Refunded => "refunded",
        }
    }
}

/// Biome columns carried by biome_buy / biome_sell rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiomeTxInfo {
    pub biome: String,
    pub shares: f64,
    pub price_per_share_bdt: f64,
}

/// Everything a caller supplies when appending a transaction row.
#[derive(Debug, Clone, Default)]
pub struct TxInsert {
    pub seller_id: Option<Uuid>,
    pub reference: Option<String>,
    pub platform_fee_bdt: i64,
    pub gateway_fee_bdt: i64,
    pub gateway_name: Option<String>,
    pub gateway_external_id: Option<String>,
    pub biome: Option<BiomeTxInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TxRecord {
    pub tx_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Option<Uuid>,
    pub reference: Option<String>,
    pub transaction_type: TxType,
    pub transaction_source: &'static str,
    pub amount_bdt: i64,
    pub status: TxStatus,
    pub platform_fee_bdt: i64,
    pub gateway_fee_bdt: i64,
    pub gateway_name: Option<String>,
    pub gateway_external_id: Option<String>,
    pub biome: Option<String>,
    pub shares: Option<f64>,
    pub price_per_share_bdt: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// === Repository functions (compose inside a caller's transaction) ===

pub fn balance_of(tx: &Transaction<'_>, user_id: Uuid) -> Result<i64> {
    tx.query_row(
        "SELECT balance_bdt FROM users WHERE user_id = ?1",
        [user_id.to_string()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| MarketError::NotFound("user".into()))
}

/// Subtract `amount` from the user's balance. Fails with
/// `INSUFFICIENT_FUNDS` when the balance cannot cover it.
pub fn debit_balance(tx: &Transaction<'_>, user_id: Uuid, amount: i64, now: DateTime<Utc>) -> Result<()> {
    if amount < 0 {
        return Err(MarketError::validation("debit amount must be non-negative"));
    }
    let balance = balance_of(tx, user_id)?;
    if balance < amount {
        return Err(MarketError::InsufficientFunds { available: balance, required: amount });
    }
    tx.execute(
        "UPDATE users SET balance_bdt = balance_bdt - ?1, updated_at = ?2 WHERE user_id = ?3",
        params![amount, now.to_rfc3339(), user_id.to_string()],
    )?;
    Ok(())
}

/// Add `amount` to the user's balance.
pub fn credit_balance(tx: &Transaction<'_>, user_id: Uuid, amount: i64, now: DateTime<Utc>) -> Result<()> {
    if amount < 0 {
        return Err(MarketError::validation("credit amount must be non-negative"));
    }
    let updated = tx.execute(
        "UPDATE users SET balance_bdt = balance_bdt + ?1, updated_at = ?2 WHERE user_id = ?3",
        params![amount, now.to_rfc3339(), user_id.to_string()],
    )?;
    if updated == 0 {
        return Err(MarketError::NotFound("user".into()));
    }
    Ok(())
}

/// Append an immutable row to the unified transaction table.
pub fn insert_transaction(
    tx: &Transaction<'_>,
    buyer_id: Uuid,
    kind: TxType,
    amount_bdt: i64,
    status: TxStatus,
    insert: &TxInsert,
    now: DateTime<Utc>,
) -> Result<TxRecord> {
    let tx_id = Uuid::new_v4();
    let completed_at = matches!(status, TxStatus::Completed).then_some(now);
    let (biome, shares, pps) = match &insert.biome {
        Some(info) => (Some(info.biome.clone()), Some(info.shares), Some(info.price_per_share_bdt)),
        None => (None, None, None),
    };

    tx.execute(
        "INSERT INTO transactions (
            tx_id, buyer_id, seller_id, reference, transaction_type, amount_bdt,
            status, platform_fee_bdt, gateway_fee_bdt, gateway_name,
            gateway_external_id, completed_at, biome, shares, price_per_share_bdt,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            tx_id.to_string(),
            buyer_id.to_string(),
            insert.seller_id.map(|id| id.to_string()),
            insert.reference,
            kind.as_str(),
            amount_bdt,
            status.as_str(),
            insert.platform_fee_bdt,
            insert.gateway_fee_bdt,
            insert.gateway_name,
            insert.gateway_external_id,
            completed_at.map(|t| t.to_rfc3339()),
            biome,
            shares,
            pps,
            now.to_rfc3339(),
        ],
    )?;

    Ok(TxRecord {
        tx_id,
        buyer_id,
        seller_id: insert.seller_id,
        reference: insert.reference.clone(),
        transaction_type: kind,
        transaction_source: kind.source(),
        amount_bdt,
        status,
        platform_fee_bdt: insert.platform_fee_bdt,
        gateway_fee_bdt: insert.gateway_fee_bdt,
        gateway_name: insert.gateway_name.clone(),
        gateway_external_id: insert.gateway_external_id.clone(),
        biome,
        shares,
        price_per_share_bdt: pps,
        completed_at,
        created_at: now,
    })
}

/// Status transition guard. Completed rows are immutable apart from refund.
pub fn update_transaction_status(
    tx: &Transaction<'_>,
    tx_id: Uuid,
    new_status: TxStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let current: Option<String> = tx
        .query_row(
            "SELECT status FROM transactions WHERE tx_id = ?1",
            [tx_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let current = current.ok_or_else(|| MarketError::NotFound("transaction".into()))?;

    let allowed = matches!(
        (current.as_str(), new_status),
        ("pending", TxStatus::Completed)
            | ("pending", TxStatus::Failed)
            | ("completed", TxStatus::Refunded)
    );
    if !allowed {
        return Err(MarketError::Conflict(format!(
            "transaction {tx_id} cannot move {current} -> {}",
            new_status.as_str()
        )));
    }

    let completed_at = matches!(new_status, TxStatus::Completed).then(|| now.to_rfc3339());
    tx.execute(
        "UPDATE transactions SET status = ?1,
                completed_at = COALESCE(?2, completed_at)
         WHERE tx_id = ?3",
        params![new_status.as_str(), completed_at, tx_id.to_string()],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TxRecord> {
    let kind = TxType::from_str(&row.get::<_, String>(4)?).unwrap_or(TxType::Transfer);
    let status_raw: String = row.get(6)?;
    let status = match status_raw.as_str() {
        "pending" => TxStatus::Pending,
        "failed" => TxStatus::Failed,
        "refunded" => TxStatus::Refunded,
        _ => TxStatus::Completed,
    };
    Ok(TxRecord {
        tx_id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        buyer_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        seller_id: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        reference: row.get(3)?,
        transaction_type: kind,
        transaction_source: kind.source(),
        amount_bdt: row.get(5)?,
        status,
        platform_fee_bdt: row.get(7)?,
        gateway_fee_bdt: row.get(8)?,
        gateway_name: row.get(9)?,
        gateway_external_id: row.get(10)?,
        completed_at: row
            .get::<_, Option<String>>(11)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)),
        biome: row.get(12)?,
        shares: row.get(13)?,
        price_per_share_bdt: row.get(14)?,
        created_at: row
            .get::<_, String>(15)?
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

const TX_COLUMNS: &str = "tx_id, buyer_id, seller_id, reference, transaction_type, amount_bdt,
    status, platform_fee_bdt, gateway_fee_bdt, gateway_name, gateway_external_id,
    completed_at, biome, shares, price_per_share_bdt, created_at";

/// Paged listing of a user's transactions, optionally filtered by biome.
pub fn list_user_transactions(
    tx: &Transaction<'_>,
    user_id: Uuid,
    biome: Option<&str>,
    page: u32,
    limit: u32,
) -> Result<(Vec<TxRecord>, u64)> {
    let offset = (page.saturating_sub(1) as i64) * limit as i64;

    let (total, rows) = match biome {
        Some(b) => {
            let total: i64 = tx.query_row(
                "SELECT COUNT(*) FROM transactions WHERE buyer_id = ?1 AND biome = ?2",
                params![user_id.to_string(), b],
                |row| row.get(0),
            )?;
            let mut stmt = tx.prepare(&format!(
                "SELECT {TX_COLUMNS} FROM transactions
                 WHERE buyer_id = ?1 AND biome = ?2
                 ORDER BY created_at DESC LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt
                .query_map(params![user_id.to_string(), b, limit, offset], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (total, rows)
        }
        None => {
            let total: i64 = tx.query_row(
                "SELECT COUNT(*) FROM transactions WHERE buyer_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )?;
            let mut stmt = tx.prepare(&format!(
                "SELECT {TX_COLUMNS} FROM transactions
                 WHERE buyer_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(params![user_id.to_string(), limit, offset], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (total, rows)
        }
    };

    Ok((rows, total as u64))
}

// === Facade ===

/// Ledger facade owning the lock + transaction envelope.
#[derive(Clone)]
pub struct Ledger {
    db: Db,
    clock: Clock,
}

impl Ledger {
    pub fn new(db: Db, clock: Clock) -> Self {
        Self { db, clock }
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64> {
        self.db
            .with_read_retry(|conn| {
                conn.query_row(
                    "SELECT balance_bdt FROM users WHERE user_id = ?1",
                    [user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| MarketError::NotFound("user".into()))
            })
            .await
    }

    /// Debit under the user's row lock and journal one completed row.
    pub async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: TxType,
        insert: TxInsert,
    ) -> Result<TxRecord> {
        let now = self.clock.now();
        self.db
            .with_user_tx(user_id, move |tx| {
                debit_balance(tx, user_id, amount, now)?;
                insert_transaction(tx, user_id, kind, amount, TxStatus::Completed, &insert, now)
            })
            .await
    }

    /// Credit under the user's row lock and journal one completed row.
    pub async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: TxType,
        insert: TxInsert,
    ) -> Result<TxRecord> {
        let now = self.clock.now();
        self.db
            .with_user_tx(user_id, move |tx| {
                credit_balance(tx, user_id, amount, now)?;
                insert_transaction(tx, user_id, kind, amount, TxStatus::Completed, &insert, now)
            })
            .await
    }

    /// Move `amount` from one user to another; the target receives
    /// `amount - fee`, the fee stays as platform revenue.
    pub async fn transfer(
        &self,
        from: Uuid,
        to: Uuid,
        amount: i64,
        fee: i64,
        reference: Option<String>,
    ) -> Result<TxRecord> {
        if fee < 0 || fee > amount {
            return Err(MarketError::validation("fee must be within [0, amount]"));
        }
        let now = self.clock.now();
        self.db
            .with_two_user_tx(from, to, move |tx| {
                debit_balance(tx, from, amount, now)?;
                credit_balance(tx, to, amount - fee, now)?;
                let insert = TxInsert {
                    seller_id: Some(to),
                    reference,
                    platform_fee_bdt: fee,
                    ..Default::default()
                };
                insert_transaction(tx, from, TxType::Transfer, amount, TxStatus::Completed, &insert, now)
            })
            .await
    }

    /// Credit a completed top-up from the payment gateway.
    pub async fn topup(
        &self,
        user_id: Uuid,
        amount: i64,
        gateway_name: String,
        gateway_fee: i64,
        external_id: Option<String>,
    ) -> Result<TxRecord> {
        let now = self.clock.now();
        self.db
            .with_user_tx(user_id, move |tx| {
                credit_balance(tx, user_id, amount - gateway_fee, now)?;
                tx.execute(
                    "INSERT INTO payment_events (gateway, external_id, user_id, amount_bdt, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'completed', ?5)",
                    params![
                        gateway_name,
                        external_id,
                        user_id.to_string(),
                        amount,
                        now.to_rfc3339()
                    ],
                )?;
                let insert = TxInsert {
                    gateway_fee_bdt: gateway_fee,
                    gateway_name: Some(gateway_name.clone()),
                    gateway_external_id: external_id.clone(),
                    ..Default::default()
                };
                insert_transaction(tx, user_id, TxType::Topup, amount, TxStatus::Completed, &insert, now)
            })
            .await
    }

    pub async fn transactions(
        &self,
        user_id: Uuid,
        biome: Option<String>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<TxRecord>, u64)> {
        self.db
            .with_tx(move |tx| list_user_transactions(tx, user_id, biome.as_deref(), page, limit))
            .await
    }
}
