//! Instrument catalogue.
//!
//! Instruments are persisted rows; the engine keeps a read cache that is
//! refreshed on admin mutation. Deletion is soft (status + deleted_at).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::Db;
use crate::error::{MarketError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Forex,
    Commodity,
    Index,
    Crypto,
    Derivative,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Equity => "equity",
            AssetClass::Forex => "forex",
            AssetClass::Commodity => "commodity",
            AssetClass::Index => "index",
            AssetClass::Crypto => "crypto",
            AssetClass::Derivative => "derivative",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "equity" => Some(AssetClass::Equity),
            "forex" => Some(AssetClass::Forex),
            "commodity" => Some(AssetClass::Commodity),
            "index" => Some(AssetClass::Index),
            "crypto" => Some(AssetClass::Crypto),
            "derivative" => Some(AssetClass::Derivative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentStatus {
    Active,
    Halted,
    Closed,
}

impl InstrumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentStatus::Active => "active",
            InstrumentStatus::Halted => "halted",
            InstrumentStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(InstrumentStatus::Active),
            "halted" => Some(InstrumentStatus::Halted),
            "closed" => Some(InstrumentStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Instrument {
    pub instrument_id: Uuid,
    pub symbol: String,
    pub asset_class: AssetClass,
    pub tick_size: f64,
    pub lot_size: f64,
    pub leverage_max: f64,
    pub margin_allowed: bool,
    pub short_allowed: bool,
    pub status: InstrumentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct InstrumentCreate {
    pub symbol: String,
    pub asset_class: String,
    pub tick_size: f64,
    pub lot_size: f64,
    #[serde(default = "default_leverage")]
    pub leverage_max: f64,
    #[serde(default)]
    pub margin_allowed: bool,
    #[serde(default)]
    pub short_allowed: bool,
}

fn default_leverage() -> f64 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
pub struct InstrumentPatch {
    pub tick_size: Option<f64>,
    pub lot_size: Option<f64>,
    pub leverage_max: Option<f64>,
    pub margin_allowed: Option<bool>,
    pub short_allowed: Option<bool>,
    pub status: Option<String>,
}

const COLUMNS: &str = "instrument_id, symbol, asset_class, tick_size, lot_size,
    leverage_max, margin_allowed, short_allowed, status, created_at";

fn row_to_instrument(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instrument> {
    Ok(Instrument {
        instrument_id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        symbol: row.get(1)?,
        asset_class: AssetClass::from_str(&row.get::<_, String>(2)?).unwrap_or(AssetClass::Equity),
        tick_size: row.get(3)?,
        lot_size: row.get(4)?,
        leverage_max: row.get(5)?,
        margin_allowed: row.get::<_, i64>(6)? != 0,
        short_allowed: row.get::<_, i64>(7)? != 0,
        status: InstrumentStatus::from_str(&row.get::<_, String>(8)?)
            .unwrap_or(InstrumentStatus::Active),
        created_at: row
            .get::<_, String>(9)?
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

pub fn get_instrument(tx: &Transaction<'_>, id: Uuid) -> Result<Option<Instrument>> {
    Ok(tx
        .query_row(
            &format!("SELECT {COLUMNS} FROM instruments WHERE instrument_id = ?1 AND deleted_at IS NULL"),
            [id.to_string()],
            row_to_instrument,
        )
        .optional()?)
}

/// Instrument catalogue with a read-through cache.
pub struct InstrumentStore {
    db: Db,
    clock: Clock,
    cache: RwLock<HashMap<Uuid, Instrument>>,
}

impl InstrumentStore {
    pub fn new(db: Db, clock: Clock) -> Self {
        Self { db, clock, cache: RwLock::new(HashMap::new()) }
    }

    /// Preload the cache at startup.
    pub async fn load(&self) -> Result<()> {
        let instruments = self.list().await?;
        let mut cache = self.cache.write();
        cache.clear();
        for instrument in instruments {
            cache.insert(instrument.instrument_id, instrument);
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Instrument>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM instruments WHERE deleted_at IS NULL ORDER BY symbol"
                ))?;
                let rows = stmt
                    .query_map([], row_to_instrument)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    pub fn cached(&self, id: Uuid) -> Option<Instrument> {
        self.cache.read().get(&id).cloned()
    }

    pub async fn get(&self, id: Uuid) -> Result<Instrument> {
        if let Some(instrument) = self.cached(id) {
            return Ok(instrument);
        }
        let found = self.db.with_tx(move |tx| get_instrument(tx, id)).await?;
        match found {
            Some(instrument) => {
                self.cache.write().insert(id, instrument.clone());
                Ok(instrument)
            }
            None => Err(MarketError::NotFound("instrument".into())),
        }
    }

    pub async fn create(&self, payload: InstrumentCreate) -> Result<Instrument> {
        if payload.tick_size <= 0.0 || payload.lot_size <= 0.0 {
            return Err(MarketError::validation("tick_size and lot_size must be positive"));
        }
        if payload.leverage_max < 1.0 {
            return Err(MarketError::validation("leverage_max must be >= 1"));
        }
        let asset_class = AssetClass::from_str(&payload.asset_class)
            .ok_or_else(|| MarketError::validation("unknown asset_class"))?;

        let instrument = Instrument {
            instrument_id: Uuid::new_v4(),
            symbol: payload.symbol.to_uppercase(),
            asset_class,
            tick_size: payload.tick_size,
            lot_size: payload.lot_size,
            leverage_max: payload.leverage_max,
            margin_allowed: payload.margin_allowed,
            short_allowed: payload.short_allowed,
            status: InstrumentStatus::Active,
            created_at: self.clock.now(),
        };

        let row = instrument.clone();
        self.db
            .with_tx(move |tx| {
                let result = tx.execute(
                    "INSERT INTO instruments (instrument_id, symbol, asset_class, tick_size,
                        lot_size, leverage_max, margin_allowed, short_allowed, status,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                    params![
                        row.instrument_id.to_string(),
                        row.symbol,
                        row.asset_class.as_str(),
                        row.tick_size,
                        row.lot_size,
                        row.leverage_max,
                        row.margin_allowed as i64,
                        row.short_allowed as i64,
                        row.status.as_str(),
                        row.created_at.to_rfc3339(),
                    ],
                );
                match result {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Err(MarketError::Conflict("symbol already exists".into()))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        self.cache.write().insert(instrument.instrument_id, instrument.clone());
        Ok(instrument)
    }

    pub async fn update(&self, id: Uuid, patch: InstrumentPatch) -> Result<Instrument> {
        let status = match patch.status.as_deref() {
            Some(raw) => Some(
                InstrumentStatus::from_str(raw)
                    .ok_or_else(|| MarketError::validation("unknown instrument status"))?,
            ),
            None => None,
        };
        if matches!(patch.tick_size, Some(t) if t <= 0.0)
            || matches!(patch.lot_size, Some(l) if l <= 0.0)
        {
            return Err(MarketError::validation("tick_size and lot_size must be positive"));
        }

        let now = self.clock.now();
        let updated = self
            .db
            .with_tx(move |tx| {
                let current = get_instrument(tx, id)?
                    .ok_or_else(|| MarketError::NotFound("instrument".into()))?;

                let next = Instrument {
                    tick_size: patch.tick_size.unwrap_or(current.tick_size),
                    lot_size: patch.lot_size.unwrap_or(current.lot_size),
                    leverage_max: patch.leverage_max.unwrap_or(current.leverage_max),
                    margin_allowed: patch.margin_allowed.unwrap_or(current.margin_allowed),
                    short_allowed: patch.short_allowed.unwrap_or(current.short_allowed),
                    status: status.unwrap_or(current.status),
                    ..current
                };

                tx.execute(
                    "UPDATE instruments SET tick_size = ?1, lot_size = ?2, leverage_max = ?3,
                        margin_allowed = ?4, short_allowed = ?5, status = ?6, updated_at = ?7
                     WHERE instrument_id = ?8",
                    params![
                        next.tick_size,
                        next.lot_size,
                        next.leverage_max,
                        next.margin_allowed as i64,
                        next.short_allowed as i64,
                        next.status.as_str(),
                        now.to_rfc3339(),
                        id.to_string(),
                    ],
                )?;
                Ok(next)
            })
            .await?;

        self.cache.write().insert(id, updated.clone());
        Ok(updated)
    }

    /// Soft delete: closes the instrument and stamps `deleted_at`.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let now = self.clock.now();
        self.db
            .with_tx(move |tx| {
                let updated = tx.execute(
                    "UPDATE instruments SET status = 'closed', deleted_at = ?1, updated_at = ?1
                     WHERE instrument_id = ?2 AND deleted_at IS NULL",
                    params![now.to_rfc3339(), id.to_string()],
                )?;
                if updated == 0 {
                    return Err(MarketError::NotFound("instrument".into()));
                }
                Ok(())
            })
            .await?;
        self.cache.write().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_payload(symbol: &str) -> InstrumentCreate {
        InstrumentCreate {
            symbol: symbol.into(),
            asset_class: "equity".into(),
            tick_size: 0.5,
            lot_size: 1.0,
            leverage_max: 10.0,
            margin_allowed: true,
            short_allowed: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InstrumentStore::new(Db::open_in_memory().unwrap(), Clock::new());
        let created = store.create(create_payload("acme")).await.unwrap();
        assert_eq!(created.symbol, "ACME");

        let fetched = store.get(created.instrument_id).await.unwrap();
        assert_eq!(fetched.tick_size, 0.5);
    }

    #[tokio::test]
    async fn test_duplicate_symbol_conflicts() {
        let store = InstrumentStore::new(Db::open_in_memory().unwrap(), Clock::new());
        store.create(create_payload("ACME")).await.unwrap();
        let err = store.create(create_payload("acme")).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_soft_delete_hides_instrument() {
        let store = InstrumentStore::new(Db::open_in_memory().unwrap(), Clock::new());
        let created = store.create(create_payload("ACME")).await.unwrap();
        store.delete(created.instrument_id).await.unwrap();
        assert!(store.get(created.instrument_id).await.is_err());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_patch_status() {
        let store = InstrumentStore::new(Db::open_in_memory().unwrap(), Clock::new());
        let created = store.create(create_payload("ACME")).await.unwrap();
        let patched = store
            .update(
                created.instrument_id,
                InstrumentPatch { status: Some("halted".into()), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(patched.status, InstrumentStatus::Halted);
    }
}
