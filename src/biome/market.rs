//! Biome market engine.
//!
//! Owns the seven market rows, the holding table, the attention table and
//! the redistribution cycle. Trading runs under the user's row lock; the
//! cycle runs atomically under its own lock so two ticks can never overlap.
//!
//! Redistribution per tick: a pool of `redistribution_pool_percent` of total
//! market cash is subtracted proportionally to each market's cash share and
//! granted proportionally to accumulated attention; integer rounding drift
//! is absorbed into the highest-attention biome so the pre-clamp sum is
//! exact, then each biome's price move is clamped to
//! `±max_price_move_percent` with banker's rounding at the last minor unit.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::biome::{Biome, ALL_BIOMES, ROOM_ALL};
use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::db::Db;
use crate::error::{MarketError, Result};
use crate::ledger::{self, BiomeTxInfo, TxInsert, TxRecord, TxStatus, TxType};
use crate::payment::PaymentGateway;
use crate::ws::hub::SubscriptionHub;

#[derive(Debug, Clone, Serialize)]
pub struct BiomeMarketView {
    pub biome: Biome,
    pub cash_bdt: i64,
    pub total_shares: i64,
    pub share_price_bdt: f64,
    pub attention: f64,
    pub last_redistribution_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldingView {
    pub biome: Biome,
    pub shares: f64,
    pub average_buy_price_bdt: f64,
    pub total_invested_bdt: i64,
    pub current_price_bdt: f64,
    pub current_value_bdt: f64,
    pub unrealized_gain_bdt: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioView {
    pub holdings: Vec<HoldingView>,
    pub total_invested_bdt: i64,
    pub total_current_value_bdt: f64,
    pub total_unrealized_gain_bdt: f64,
    pub total_unrealized_gain_percent: f64,
    pub cash_balance_bdt: i64,
}

/// Tagged validation result for trade-size checks.
#[derive(Debug, Clone, Serialize)]
pub struct SizeValidation {
    pub ok: bool,
    pub warnings: Vec<String>,
}

/// One biome's redistribution delta, for the published event.
#[derive(Debug, Clone, Serialize)]
pub struct RedistributionDelta {
    pub old_price: f64,
    pub new_price: f64,
    pub pool_share: i64,
    pub grant: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedistributionResult {
    pub redistributed: bool,
    pub reason: Option<String>,
    pub total_market_cash: i64,
    pub pool: i64,
    pub total_attention: f64,
    pub markets: Vec<BiomeMarketView>,
}

struct MarketRow {
    biome: Biome,
    cash: i64,
    shares: i64,
    attention: f64,
}

fn read_market(tx: &Transaction<'_>, biome: Biome) -> Result<MarketRow> {
    tx.query_row(
        "SELECT cash_bdt, total_shares, attention FROM biome_markets WHERE biome = ?1",
        [biome.as_str()],
        |row| {
            Ok(MarketRow {
                biome,
                cash: row.get(0)?,
                shares: row.get(1)?,
                attention: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| MarketError::NotFound("biome market".into()))
}

impl MarketRow {
    fn price(&self) -> f64 {
        self.cash as f64 / self.shares as f64
    }
}

pub struct BiomeMarketEngine {
    db: Db,
    clock: Clock,
    config: Arc<ConfigProvider>,
    hub: Arc<SubscriptionHub>,
    payment: Arc<dyn PaymentGateway>,
    /// Serializes redistribution cycles.
    cycle_lock: AsyncMutex<()>,
}

impl BiomeMarketEngine {
    pub fn new(
        db: Db,
        clock: Clock,
        config: Arc<ConfigProvider>,
        hub: Arc<SubscriptionHub>,
        payment: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self { db, clock, config, hub, payment, cycle_lock: AsyncMutex::new(()) }
    }

    /// Seed the seven markets with the configured initial cash and shares.
    /// Existing rows are left alone.
    pub async fn initialize_markets(&self) -> Result<()> {
        let cfg = self.config.snapshot();
        let now = self.clock.now();
        let (cash, shares) = (cfg.biome_initial_cash_bdt, cfg.biome_initial_shares.max(1));
        self.db
            .with_tx(move |tx| {
                for biome in ALL_BIOMES {
                    tx.execute(
                        "INSERT OR IGNORE INTO biome_markets
                            (biome, cash_bdt, total_shares, attention, created_at, updated_at)
                         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                        params![biome.as_str(), cash, shares, now.to_rfc3339()],
                    )?;
                }
                Ok(())
            })
            .await?;
        info!(cash, shares, "🌍 Biome markets initialized");
        Ok(())
    }

    pub async fn markets(&self) -> Result<Vec<BiomeMarketView>> {
        self.db
            .with_read_retry(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT biome, cash_bdt, total_shares, attention, last_redistribution_at
                     FROM biome_markets",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let name: String = row.get(0)?;
                        let cash: i64 = row.get(1)?;
                        let shares: i64 = row.get(2)?;
                        Ok((name, cash, shares, row.get::<_, f64>(3)?, row.get::<_, Option<String>>(4)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let mut views = Vec::with_capacity(rows.len());
                for (name, cash, shares, attention, last) in rows {
                    let Some(biome) = Biome::from_str(&name) else { continue };
                    views.push(BiomeMarketView {
                        biome,
                        cash_bdt: cash,
                        total_shares: shares,
                        share_price_bdt: cash as f64 / shares as f64,
                        attention,
                        last_redistribution_at: last
                            .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
                    });
                }
                views.sort_by_key(|v| v.biome.as_str());
                Ok(views)
            })
            .await
    }

    pub async fn market(&self, biome: Biome) -> Result<BiomeMarketView> {
        self.markets()
            .await?
            .into_iter()
            .find(|m| m.biome == biome)
            .ok_or_else(|| MarketError::NotFound("biome market".into()))
    }

    /// Size check against the market-cash safeguard. Tagged result instead
    /// of an error so callers can surface the warnings.
    pub fn validate_transaction_size(
        market_cash: i64,
        amount: i64,
        max_transaction_percent: f64,
    ) -> SizeValidation {
        let cap = (market_cash as f64 * max_transaction_percent / 100.0).floor() as i64;
        if amount > cap {
            SizeValidation {
                ok: false,
                warnings: vec![format!(
                    "amount {amount} exceeds {max_transaction_percent}% of market cash ({cap})"
                )],
            }
        } else {
            SizeValidation { ok: true, warnings: Vec::new() }
        }
    }

    /// Buy biome shares for `amount_bdt`. The fee is retained as platform
    /// revenue; only the principal enters market cash.
    pub async fn buy(&self, user_id: Uuid, biome: Biome, amount_bdt: i64) -> Result<TxRecord> {
        let cfg = self.config.snapshot();
        if cfg.biome_trading_paused {
            return Err(MarketError::validation("biome trading is paused"));
        }
        if amount_bdt <= 0 {
            return Err(MarketError::validation("amount_bdt must be positive"));
        }

        let now = self.clock.now();
        let fee_pct = cfg.biome_trade_fee_percent;
        let max_pct = cfg.max_transaction_percent;

        let result = self
            .db
            .with_user_tx(user_id, move |tx| {
                let market = read_market(tx, biome)?;

                let validation = Self::validate_transaction_size(market.cash, amount_bdt, max_pct);
                if !validation.ok {
                    return Err(MarketError::validation_with(
                        "transaction size exceeds the market safeguard",
                        json!({ "amount_bdt": validation.warnings }),
                    ));
                }

                let price = market.price();
                let shares = amount_bdt as f64 / price;
                let fee = (amount_bdt as f64 * fee_pct / 100.0).floor() as i64;
                let total_debit = amount_bdt + fee;

                ledger::debit_balance(tx, user_id, total_debit, now)?;

                tx.execute(
                    "INSERT INTO biome_holdings (user_id, biome, shares, total_invested_bdt, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (user_id, biome) DO UPDATE SET
                        shares = shares + excluded.shares,
                        total_invested_bdt = total_invested_bdt + excluded.total_invested_bdt,
                        updated_at = excluded.updated_at",
                    params![user_id.to_string(), biome.as_str(), shares, amount_bdt, now.to_rfc3339()],
                )?;

                tx.execute(
                    "UPDATE biome_markets SET cash_bdt = cash_bdt + ?1, last_activity_at = ?2,
                            updated_at = ?2
                     WHERE biome = ?3",
                    params![amount_bdt, now.to_rfc3339(), biome.as_str()],
                )?;

                let insert = TxInsert {
                    platform_fee_bdt: fee,
                    biome: Some(BiomeTxInfo {
                        biome: biome.as_str().to_string(),
                        shares,
                        price_per_share_bdt: price,
                    }),
                    ..Default::default()
                };
                let record = ledger::insert_transaction(
                    tx,
                    user_id,
                    TxType::BiomeBuy,
                    amount_bdt,
                    TxStatus::Completed,
                    &insert,
                    now,
                )?;
                Ok((record, shares, price, fee))
            })
            .await;

        match result {
            Ok((record, shares, price, fee)) => {
                info!(
                    user = %user_id,
                    biome = biome.as_str(),
                    shares = format!("{shares:.4}"),
                    price,
                    fee,
                    "🟢 Biome buy executed"
                );
                self.publish_market_update(biome).await;
                Ok(record)
            }
            Err(MarketError::InsufficientFunds { available, required }) => {
                // Hand the caller a payment URL when the gateway can help.
                let reference = format!("biome-{}-{}", biome.as_str(), user_id);
                match self.payment.initiate(required, &reference).await {
                    Ok(initiation) => Err(MarketError::PaymentRequired {
                        required,
                        payment_url: Some(initiation.payment_url),
                        gateway: self.payment.name().to_string(),
                    }),
                    Err(_) => Err(MarketError::InsufficientFunds { available, required }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Sell biome shares. Average buy price stays; invested shrinks
    /// proportionally, reaching zero with the last share.
    pub async fn sell(&self, user_id: Uuid, biome: Biome, shares: f64) -> Result<TxRecord> {
        let cfg = self.config.snapshot();
        if cfg.biome_trading_paused {
            return Err(MarketError::validation("biome trading is paused"));
        }
        if !(shares > 0.0) || !shares.is_finite() {
            return Err(MarketError::validation("shares must be positive"));
        }

        let now = self.clock.now();
        let fee_pct = cfg.biome_trade_fee_percent;

        let record = self
            .db
            .with_user_tx(user_id, move |tx| {
                let holding: Option<(f64, i64)> = tx
                    .query_row(
                        "SELECT shares, total_invested_bdt FROM biome_holdings
                         WHERE user_id = ?1 AND biome = ?2",
                        params![user_id.to_string(), biome.as_str()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let (held, invested) = holding.unwrap_or((0.0, 0));
                if held + 1e-9 < shares {
                    return Err(MarketError::validation_with(
                        "insufficient shares",
                        json!({ "shares": [format!("holding {held:.4} < {shares:.4}")] }),
                    ));
                }

                let market = read_market(tx, biome)?;
                let price = market.price();
                let gross = (shares * price).floor() as i64;
                if gross > market.cash {
                    return Err(MarketError::validation(
                        "market cash cannot cover this sale right now",
                    ));
                }
                let fee = (gross as f64 * fee_pct / 100.0).floor() as i64;
                let net = gross - fee;

                // Proportional reduction keeps the average price unchanged.
                let remaining = (held - shares).max(0.0);
                let remaining_invested = if remaining <= 1e-9 {
                    0
                } else {
                    (invested as f64 * (remaining / held)).round() as i64
                };
                let avg_price = if held > 0.0 { invested as f64 / held } else { 0.0 };
                let realized_gain = ((price - avg_price) * shares).round() as i64;

                tx.execute(
                    "UPDATE biome_holdings SET shares = ?1, total_invested_bdt = ?2, updated_at = ?3
                     WHERE user_id = ?4 AND biome = ?5",
                    params![
                        remaining,
                        remaining_invested,
                        now.to_rfc3339(),
                        user_id.to_string(),
                        biome.as_str()
                    ],
                )?;

                ledger::credit_balance(tx, user_id, net, now)?;

                tx.execute(
                    "UPDATE biome_markets SET cash_bdt = cash_bdt - ?1, last_activity_at = ?2,
                            updated_at = ?2
                     WHERE biome = ?3",
                    params![gross, now.to_rfc3339(), biome.as_str()],
                )?;

                debug!(realized_gain, "Biome sell realized gain");

                let insert = TxInsert {
                    platform_fee_bdt: fee,
                    biome: Some(BiomeTxInfo {
                        biome: biome.as_str().to_string(),
                        shares,
                        price_per_share_bdt: price,
                    }),
                    ..Default::default()
                };
                ledger::insert_transaction(
                    tx,
                    user_id,
                    TxType::BiomeSell,
                    gross,
                    TxStatus::Completed,
                    &insert,
                    now,
                )
            })
            .await?;

        info!(user = %user_id, biome = biome.as_str(), shares = format!("{shares:.4}"), "🔴 Biome sell executed");
        self.publish_market_update(biome).await;
        Ok(record)
    }

    /// Accumulate attention for (user, biome) and the market.
    pub async fn track_attention(&self, user_id: Uuid, biome: Biome, score: f64) -> Result<f64> {
        if !(score > 0.0) || !score.is_finite() {
            return Err(MarketError::validation("attention_score must be positive"));
        }
        let now = self.clock.now();
        self.db
            .with_tx(move |tx| {
                tx.execute(
                    "INSERT INTO attention_scores (user_id, biome, score, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (user_id, biome) DO UPDATE SET
                        score = score + excluded.score,
                        updated_at = excluded.updated_at",
                    params![user_id.to_string(), biome.as_str(), score, now.to_rfc3339()],
                )?;
                tx.execute(
                    "UPDATE biome_markets SET attention = attention + ?1, last_activity_at = ?2,
                            updated_at = ?2
                     WHERE biome = ?3",
                    params![score, now.to_rfc3339(), biome.as_str()],
                )?;
                let total: f64 = tx.query_row(
                    "SELECT score FROM attention_scores WHERE user_id = ?1 AND biome = ?2",
                    params![user_id.to_string(), biome.as_str()],
                    |row| row.get(0),
                )?;
                Ok(total)
            })
            .await
    }

    pub async fn portfolio(&self, user_id: Uuid) -> Result<PortfolioView> {
        let markets = self.markets().await?;
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT biome, shares, total_invested_bdt FROM biome_holdings
                     WHERE user_id = ?1 AND shares > 0",
                )?;
                let rows = stmt
                    .query_map([user_id.to_string()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, i64>(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut holdings = Vec::new();
                let mut total_invested = 0i64;
                let mut total_value = 0f64;
                for (name, shares, invested) in rows {
                    let Some(biome) = Biome::from_str(&name) else { continue };
                    let price = markets
                        .iter()
                        .find(|m| m.biome == biome)
                        .map(|m| m.share_price_bdt)
                        .unwrap_or(0.0);
                    let value = shares * price;
                    holdings.push(HoldingView {
                        biome,
                        shares,
                        average_buy_price_bdt: if shares > 0.0 {
                            invested as f64 / shares
                        } else {
                            0.0
                        },
                        total_invested_bdt: invested,
                        current_price_bdt: price,
                        current_value_bdt: value,
                        unrealized_gain_bdt: value - invested as f64,
                    });
                    total_invested += invested;
                    total_value += value;
                }

                let balance: i64 = conn
                    .query_row(
                        "SELECT balance_bdt FROM users WHERE user_id = ?1",
                        [user_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?
                    .unwrap_or(0);

                let gain = total_value - total_invested as f64;
                Ok(PortfolioView {
                    holdings,
                    total_invested_bdt: total_invested,
                    total_current_value_bdt: total_value,
                    total_unrealized_gain_bdt: gain,
                    total_unrealized_gain_percent: if total_invested > 0 {
                        gain / total_invested as f64 * 100.0
                    } else {
                        0.0
                    },
                    cash_balance_bdt: balance,
                })
            })
            .await
    }

    /// Paged biome trade history for one user.
    pub async fn transactions(
        &self,
        user_id: Uuid,
        biome: Option<Biome>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<TxRecord>, u64)> {
        self.db
            .with_tx(move |tx| {
                ledger::list_user_transactions(
                    tx,
                    user_id,
                    biome.map(|b| b.as_str().to_string()).as_deref(),
                    page,
                    limit,
                )
            })
            .await
            .map(|(rows, total)| {
                let rows = rows
                    .into_iter()
                    .filter(|r| {
                        matches!(r.transaction_type, TxType::BiomeBuy | TxType::BiomeSell)
                    })
                    .collect();
                (rows, total)
            })
    }

    /// One redistribution cycle. Returns what happened; publishes a
    /// `biome_market_update` event when anything moved.
    pub async fn redistribute(&self) -> Result<RedistributionResult> {
        let _cycle = self.cycle_lock.lock().await;
        let cfg = self.config.snapshot();
        let now = self.clock.now();

        if cfg.biome_prices_frozen {
            return Ok(RedistributionResult {
                redistributed: false,
                reason: Some("prices frozen".into()),
                total_market_cash: 0,
                pool: 0,
                total_attention: 0.0,
                markets: Vec::new(),
            });
        }

        let pool_pct = cfg.redistribution_pool_percent;
        let cap_pct = cfg.max_price_move_percent;

        let (redistributed, tmc, pool, total_attention, deltas) = self
            .db
            .with_tx(move |tx| {
                let mut markets = Vec::with_capacity(ALL_BIOMES.len());
                for biome in ALL_BIOMES {
                    markets.push(read_market(tx, biome)?);
                }

                let tmc: i64 = markets.iter().map(|m| m.cash).sum();
                let pool = (tmc as f64 * pool_pct / 100.0).floor() as i64;
                let total_attention: f64 = markets.iter().map(|m| m.attention).sum();

                if total_attention <= 0.0 || pool == 0 {
                    // No-op cycle: stamp the instant, clear attention.
                    for market in &markets {
                        tx.execute(
                            "UPDATE biome_markets SET attention = 0,
                                    last_redistribution_at = ?1, updated_at = ?1
                             WHERE biome = ?2",
                            params![now.to_rfc3339(), market.biome.as_str()],
                        )?;
                    }
                    tx.execute("UPDATE attention_scores SET score = 0, updated_at = ?1", [now.to_rfc3339()])?;
                    return Ok((false, tmc, pool, total_attention, Vec::new()));
                }

                // Allocation: subtract each market's cash-proportional pool
                // share, add its attention-proportional grant.
                let mut new_cash: Vec<i64> = Vec::with_capacity(markets.len());
                for market in &markets {
                    let pool_share =
                        (pool as f64 * market.cash as f64 / tmc as f64).floor() as i64;
                    let grant =
                        (pool as f64 * market.attention / total_attention).floor() as i64;
                    new_cash.push(market.cash - pool_share + grant);
                }

                // Rounding drift goes to the highest-attention biome so the
                // pre-clamp total is exactly conserved.
                let drift = tmc - new_cash.iter().sum::<i64>();
                if drift != 0 {
                    let top = markets
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.attention.total_cmp(&b.1.attention))
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    new_cash[top] += drift;
                }

                // Clamp each biome's price move, banker's rounding at the
                // last minor unit.
                let mut deltas = Vec::with_capacity(markets.len());
                for (market, cash) in markets.iter().zip(new_cash.iter_mut()) {
                    let old_price = market.price();
                    let proposed = *cash as f64 / market.shares as f64;
                    let lo = old_price * (1.0 - cap_pct / 100.0);
                    let hi = old_price * (1.0 + cap_pct / 100.0);
                    let clamped = proposed.clamp(lo, hi);
                    if (clamped - proposed).abs() > f64::EPSILON {
                        *cash = (clamped * market.shares as f64).round_ties_even() as i64;
                    }

                    let pool_share =
                        (pool as f64 * market.cash as f64 / tmc as f64).floor() as i64;
                    let grant =
                        (pool as f64 * market.attention / total_attention).floor() as i64;
                    deltas.push((
                        market.biome,
                        RedistributionDelta {
                            old_price,
                            new_price: *cash as f64 / market.shares as f64,
                            pool_share,
                            grant,
                        },
                    ));
                }

                for (market, cash) in markets.iter().zip(new_cash.iter()) {
                    tx.execute(
                        "UPDATE biome_markets SET cash_bdt = ?1, attention = 0,
                                last_redistribution_at = ?2, updated_at = ?2
                         WHERE biome = ?3",
                        params![cash, now.to_rfc3339(), market.biome.as_str()],
                    )?;
                    tx.execute(
                        "INSERT INTO price_history (biome, price, cash_bdt, attention, recorded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            market.biome.as_str(),
                            *cash as f64 / market.shares as f64,
                            cash,
                            market.attention,
                            now.to_rfc3339(),
                        ],
                    )?;
                }
                tx.execute("UPDATE attention_scores SET score = 0, updated_at = ?1", [now.to_rfc3339()])?;

                Ok((true, tmc, pool, total_attention, deltas))
            })
            .await?;

        let markets = self.markets().await?;
        let result = RedistributionResult {
            redistributed,
            reason: (!redistributed).then(|| "no attention or empty pool".to_string()),
            total_market_cash: tmc,
            pool,
            total_attention,
            markets: markets.clone(),
        };

        if redistributed {
            debug!(tmc, pool, total_attention, "Redistribution cycle complete");
            let timestamp = now.to_rfc3339();
            let base = json!({
                "type": "biome_market_update",
                "timestamp": timestamp,
                "markets": markets,
                "total_market_cash": tmc,
                "pool": pool,
                "total_attention": total_attention,
            });
            self.hub.broadcast(ROOM_ALL, &base);
            for (biome, delta) in &deltas {
                let mut event = base.clone();
                event["biome"] = json!(biome.as_str());
                event["redistribution"] = json!(delta);
                self.hub.broadcast(&biome.room(), &event);
            }
        }

        Ok(result)
    }

    /// Recent redistribution price points for one biome.
    pub async fn price_history(&self, biome: Biome, limit: u32) -> Result<Vec<serde_json::Value>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT price, cash_bdt, attention, recorded_at FROM price_history
                     WHERE biome = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![biome.as_str(), limit.max(1)], |row| {
                        Ok(json!({
                            "price": row.get::<_, f64>(0)?,
                            "cash_bdt": row.get::<_, i64>(1)?,
                            "attention": row.get::<_, f64>(2)?,
                            "recorded_at": row.get::<_, String>(3)?,
                        }))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    async fn publish_market_update(&self, biome: Biome) {
        let Ok(view) = self.market(biome).await else { return };
        let event = json!({
            "type": "biome_market_update",
            "timestamp": self.clock.now().to_rfc3339(),
            "market": view,
        });
        self.hub.broadcast(&biome.room(), &event);
        self.hub.broadcast(ROOM_ALL, &event);
    }
}
