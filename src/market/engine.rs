//! Matching engine.
//!
//! One book per instrument behind a dedicated async mutex; an order's whole
//! placement-and-matching cycle runs under that lock. Matching itself never
//! suspends (the in-memory walk is synchronous); the settlement commit at
//! the end does. Fills are settled and persisted first, in one atomic
//! commit, and only then applied to the in-memory book, so a failed debit
//! leaves both the store and the book untouched.
//!
//! Dormant stop / stop-limit / trailing-stop orders live beside the book and
//! are re-evaluated against the last trade price after every match; a
//! triggered stop re-enters the standard taker path. OCO groups are tracked
//! per instrument and any fill cancels the filled order's siblings.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::db::Db;
use crate::error::{MarketError, Result};
use crate::ledger;
use crate::market::book::{DepthLevel, MatchPlan, OrderBook, RestingOrder};
use crate::market::instruments::{Instrument, InstrumentStore};
use crate::market::margin::MarginService;
use crate::market::risk::RiskEngine;
use crate::market::store;
use crate::market::types::{
    lots_to_qty, price_to_ticks, qty_to_lots, ticks_to_price, Order, OrderSide, OrderStatus,
    OrderType, PlaceOrder, PriceTicks, TimeInForce, Trade, VenueStatus,
};
use crate::pricing::PricingEngine;
use crate::ws::hub::SubscriptionHub;

/// A stop-family order waiting for its trigger.
#[derive(Debug, Clone)]
struct DormantStop {
    order: Order,
    /// Current trigger price; trailing stops re-anchor this continuously.
    trigger: f64,
    /// Most favorable price seen since placement (trailing only).
    best_seen: Option<f64>,
}

/// Per-instrument state guarded by one async mutex.
struct InstrumentBook {
    instrument: Instrument,
    book: OrderBook,
    dormant: Vec<DormantStop>,
    /// OCO group -> live member order ids (resting or dormant).
    oco: HashMap<String, HashSet<Uuid>>,
    last_trade_price: Option<f64>,
    next_seq: u64,
}

impl InstrumentBook {
    fn register_oco(&mut self, group: &str, order_id: Uuid) {
        self.oco.entry(group.to_string()).or_default().insert(order_id);
    }

    fn drop_oco_member(&mut self, group: &str, order_id: Uuid) {
        if let Some(members) = self.oco.get_mut(group) {
            members.remove(&order_id);
            if members.is_empty() {
                self.oco.remove(group);
            }
        }
    }
}

pub struct MatchingEngine {
    db: Db,
    clock: Clock,
    config: Arc<ConfigProvider>,
    hub: Arc<SubscriptionHub>,
    pricing: Arc<PricingEngine>,
    margin: Arc<MarginService>,
    risk: RiskEngine,
    instruments: Arc<InstrumentStore>,
    books: RwLock<HashMap<Uuid, Arc<AsyncMutex<InstrumentBook>>>>,
    venue: RwLock<(VenueStatus, Option<String>)>,
}

impl MatchingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        clock: Clock,
        config: Arc<ConfigProvider>,
        hub: Arc<SubscriptionHub>,
        pricing: Arc<PricingEngine>,
        margin: Arc<MarginService>,
        risk: RiskEngine,
        instruments: Arc<InstrumentStore>,
    ) -> Self {
        Self {
            db,
            clock,
            config,
            hub,
            pricing,
            margin,
            risk,
            instruments,
            books: RwLock::new(HashMap::new()),
            venue: RwLock::new((VenueStatus::Open, None)),
        }
    }

    // === Venue status ===

    pub fn venue_status(&self) -> (VenueStatus, Option<String>) {
        self.venue.read().clone()
    }

    pub async fn load_venue_status(&self) -> Result<()> {
        let loaded = self
            .db
            .with_conn(|conn| {
                let row: (String, Option<String>) = conn.query_row(
                    "SELECT status, reason FROM market_status WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(row)
            })
            .await?;
        *self.venue.write() =
            (VenueStatus::from_str(&loaded.0).unwrap_or(VenueStatus::Open), loaded.1);
        Ok(())
    }

    pub async fn set_venue_status(
        &self,
        status: VenueStatus,
        reason: Option<String>,
        actor: Option<Uuid>,
    ) -> Result<()> {
        let now = self.clock.now();
        let persisted_reason = reason.clone();
        self.db
            .with_tx(move |tx| {
                tx.execute(
                    "UPDATE market_status SET status = ?1, reason = ?2, updated_at = ?3 WHERE id = 1",
                    rusqlite::params![status.as_str(), persisted_reason, now.to_rfc3339()],
                )?;
                tx.execute(
                    "INSERT INTO audit_logs (actor_id, action, detail, created_at)
                     VALUES (?1, 'market_status', ?2, ?3)",
                    rusqlite::params![
                        actor.map(|a| a.to_string()),
                        status.as_str(),
                        now.to_rfc3339()
                    ],
                )?;
                Ok(())
            })
            .await?;
        *self.venue.write() = (status, reason.clone());
        info!(status = status.as_str(), "🏛️ Market status changed");
        for room in self.hub.rooms_matching("status:") {
            self.hub.broadcast(
                &room,
                &json!({
                    "type": "market_status",
                    "status": status.as_str(),
                    "reason": reason,
                    "timestamp": now.to_rfc3339(),
                }),
            );
        }
        Ok(())
    }

    // === Book access ===

    async fn book_handle(&self, instrument: &Instrument) -> Result<Arc<AsyncMutex<InstrumentBook>>> {
        if let Some(handle) = self.books.read().get(&instrument.instrument_id) {
            return Ok(handle.clone());
        }

        let id = instrument.instrument_id;
        let next_seq = self.db.with_tx(move |tx| store::max_trade_seq(tx, id)).await?;
        let mut books = self.books.write();
        let handle = books
            .entry(id)
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(InstrumentBook {
                    instrument: instrument.clone(),
                    book: OrderBook::new(),
                    dormant: Vec::new(),
                    oco: HashMap::new(),
                    last_trade_price: None,
                    next_seq,
                }))
            })
            .clone();
        Ok(handle)
    }

    /// Rebuild in-memory books from persisted non-terminal orders. Crash
    /// recovery per instrument: resting orders re-enter the book in arrival
    /// order, stop-family orders re-enter the dormant list, the trade
    /// sequence resumes from the highest persisted number.
    pub async fn recover(&self) -> Result<()> {
        for instrument in self.instruments.list().await? {
            let id = instrument.instrument_id;
            let open = self.db.with_tx(move |tx| store::open_orders_for_instrument(tx, id)).await?;
            if open.is_empty() {
                continue;
            }
            let last_price = self
                .db
                .with_tx(move |tx| store::list_trades(tx, Some(id), 1, 0))
                .await?
                .first()
                .map(|t| t.price);
            let handle = self.book_handle(&instrument).await?;
            let mut ib = handle.lock().await;
            ib.last_trade_price = last_price;
            let mut restored = 0usize;
            for order in open {
                if order.order_type.is_stop_family() {
                    let trigger = match order.order_type {
                        OrderType::TrailingStop => {
                            // Re-anchor from scratch on the next trade.
                            order.stop_price.unwrap_or(0.0)
                        }
                        _ => order.stop_price.unwrap_or(0.0),
                    };
                    if let Some(group) = order.oco_group_id.clone() {
                        ib.register_oco(&group, order.order_id);
                    }
                    ib.dormant.push(DormantStop { order, trigger, best_seen: None });
                } else if let Some(resting) = resting_from_order(&order, &instrument) {
                    if let Some(group) = order.oco_group_id.clone() {
                        ib.register_oco(&group, order.order_id);
                    }
                    ib.book.insert(resting);
                } else {
                    continue;
                }
                restored += 1;
            }
            info!(symbol = %instrument.symbol, restored, "📖 Order book recovered");
        }
        Ok(())
    }

    // === Public queries ===

    pub async fn top_of_book(
        &self,
        instrument_id: Uuid,
    ) -> Result<(Option<(f64, f64)>, Option<(f64, f64)>, Option<f64>)> {
        let instrument = self.instruments.get(instrument_id).await?;
        let handle = self.book_handle(&instrument).await?;
        let ib = handle.lock().await;
        let map = |entry: Option<(PriceTicks, i64, usize)>| {
            entry.map(|(ticks, lots, _)| {
                (
                    ticks_to_price(ticks, instrument.tick_size),
                    lots_to_qty(lots, instrument.lot_size),
                )
            })
        };
        Ok((map(ib.book.best_bid()), map(ib.book.best_ask()), ib.last_trade_price))
    }

    pub async fn depth(
        &self,
        instrument_id: Uuid,
        levels: usize,
    ) -> Result<(Vec<serde_json::Value>, Vec<serde_json::Value>)> {
        let instrument = self.instruments.get(instrument_id).await?;
        let handle = self.book_handle(&instrument).await?;
        let ib = handle.lock().await;
        let (bids, asks) = ib.book.depth(levels);
        let render = |levels: Vec<DepthLevel>| {
            levels
                .into_iter()
                .map(|level| {
                    json!({
                        "price": ticks_to_price(level.price_ticks, instrument.tick_size),
                        "quantity": lots_to_qty(level.lots, instrument.lot_size),
                        "orders": level.orders,
                    })
                })
                .collect()
        };
        Ok((render(bids), render(asks)))
    }

    // === Order placement ===

    pub async fn place_order(&self, user_id: Uuid, request: PlaceOrder) -> Result<Order> {
        let (venue_status, reason) = self.venue_status();
        if venue_status != VenueStatus::Open {
            return Err(MarketError::MarketNotOpen(
                reason.unwrap_or_else(|| venue_status.as_str().to_string()),
            ));
        }

        let instrument = self.instruments.get(request.instrument_id).await?;

        // Idempotency: an existing order under the same client key wins.
        if let Some(client_id) = request.client_order_id.clone() {
            let existing = self
                .db
                .with_tx(move |tx| store::find_by_client_order_id(tx, user_id, &client_id))
                .await?;
            if let Some(order) = existing {
                return Ok(order);
            }
        }

        // OCO groups never span instruments.
        if let Some(group) = request.oco_group_id.clone() {
            let bound = self
                .db
                .with_tx(move |tx| store::oco_group_instrument(tx, &group))
                .await?;
            if let Some(existing) = bound {
                if existing != instrument.instrument_id {
                    return Err(MarketError::Conflict(format!(
                        "OCO group is already bound to instrument {existing}"
                    )));
                }
            }
        }

        let account_leverage = self.account_leverage_max(user_id).await?;
        let reference_price = self.reference_price(&instrument, &request)?;
        self.risk
            .validate(user_id, account_leverage, &instrument, &request, reference_price)
            .await?;

        let now = self.clock.now();
        let order = Order {
            order_id: Uuid::new_v4(),
            user_id,
            instrument_id: instrument.instrument_id,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            remaining: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            trailing_offset: request.trailing_offset,
            iceberg_visible: request.iceberg_visible,
            oco_group_id: request.oco_group_id.clone(),
            time_in_force: request.time_in_force,
            status: OrderStatus::Pending,
            client_order_id: request.client_order_id.clone(),
            leverage: request.leverage,
            created_at: now,
            updated_at: now,
        };

        let handle = self.book_handle(&instrument).await?;
        let mut ib = handle.lock().await;

        if order.order_type.is_stop_family() {
            let placed = self.place_dormant(&mut ib, order, reference_price).await?;
            self.publish_order(&placed);
            return Ok(placed);
        }

        let (placed, trades, activations) = self.run_taker(&mut ib, order, false).await?;
        self.publish_match_results(&ib, &placed, &trades);
        self.run_activations(&mut ib, activations).await;
        Ok(placed)
    }

    /// Park a stop-family order on the dormant list.
    async fn place_dormant(
        &self,
        ib: &mut InstrumentBook,
        order: Order,
        reference_price: f64,
    ) -> Result<Order> {
        let (trigger, best_seen) = match order.order_type {
            OrderType::TrailingStop => {
                let offset = order.trailing_offset.unwrap_or(0.0);
                let anchor = ib.last_trade_price.unwrap_or(reference_price);
                let trigger = match order.side {
                    OrderSide::Buy => anchor + offset,
                    OrderSide::Sell => anchor - offset,
                };
                (trigger, Some(anchor))
            }
            _ => (order.stop_price.unwrap_or(0.0), None),
        };

        let row = order.clone();
        self.db.with_tx(move |tx| store::insert_order(tx, &row)).await?;

        if let Some(group) = order.oco_group_id.clone() {
            ib.register_oco(&group, order.order_id);
        }
        ib.dormant.push(DormantStop { order: order.clone(), trigger, best_seen });
        info!(
            order = %order.order_id,
            order_type = order.order_type.as_str(),
            trigger,
            "⏸️ Stop order parked"
        );
        Ok(order)
    }

    /// Execute one taker order: plan, settle + persist, apply to the book.
    /// Returns the final order record, the trades, and any stop orders the
    /// resulting prints triggered.
    async fn run_taker(
        &self,
        ib: &mut InstrumentBook,
        mut order: Order,
        already_persisted: bool,
    ) -> Result<(Order, Vec<Trade>, Vec<Order>)> {
        let instrument = ib.instrument.clone();
        let now = self.clock.now();

        let lots = qty_to_lots(order.remaining, instrument.lot_size)
            .ok_or_else(|| MarketError::validation("quantity not aligned to lot_size"))?;
        let limit_ticks = match (order.order_type, order.price) {
            (OrderType::Market, _) => None,
            (_, Some(price)) => Some(
                price_to_ticks(price, instrument.tick_size)
                    .ok_or_else(|| MarketError::validation("price not aligned to tick_size"))?,
            ),
            (_, None) => None,
        };

        // FOK: all-or-nothing against aggregate opposing liquidity.
        if order.time_in_force == TimeInForce::Fok
            && ib.book.available_lots(order.side, limit_ticks) < lots
        {
            order.status = OrderStatus::Cancelled;
            order.updated_at = now;
            let row = order.clone();
            let persisted = already_persisted;
            self.db
                .with_tx(move |tx| {
                    if persisted {
                        store::update_order_state(
                            tx,
                            row.order_id,
                            OrderStatus::Cancelled,
                            row.remaining,
                            now,
                        )
                    } else {
                        store::insert_order(tx, &row)
                    }
                })
                .await?;
            info!(order = %order.order_id, "FOK rejected: insufficient liquidity");
            return Ok((order, Vec::new(), Vec::new()));
        }

        let plan = ib.book.plan_match(order.side, limit_ticks, lots);
        let base_seq = ib.next_seq;
        let outcome = self
            .settle_and_persist(&instrument, &mut order, &plan, ib, base_seq, already_persisted, now)
            .await;

        let (trades, cancelled_siblings) = match outcome {
            Ok(result) => result,
            Err(e) => {
                // Settlement rolled back; cancel the order with no trades
                // and no balance motion, leaving the book untouched.
                order.status = OrderStatus::Cancelled;
                order.updated_at = now;
                let row = order.clone();
                let persisted = already_persisted;
                let _ = self
                    .db
                    .with_tx(move |tx| {
                        if persisted {
                            store::update_order_state(
                                tx,
                                row.order_id,
                                OrderStatus::Cancelled,
                                row.remaining,
                                now,
                            )
                        } else {
                            store::insert_order(tx, &row)
                        }
                    })
                    .await;
                warn!(order = %order.order_id, "Order cancelled: settlement failed");
                return Err(e);
            }
        };

        // Commit succeeded: mutate the in-memory book to match.
        ib.book.apply_plan(order.side, &plan);
        ib.next_seq = base_seq + trades.len() as u64;
        for sibling in &cancelled_siblings {
            self.remove_from_memory(ib, sibling);
        }
        for fill in &plan.fills {
            if let (true, Some(group)) = (fill.maker_exhausted, &fill.maker_oco_group) {
                ib.drop_oco_member(group, fill.maker_order_id);
            }
        }

        if order.status == OrderStatus::Pending || order.status == OrderStatus::Partial {
            // Remainder rests.
            if let Some(resting) = resting_from_order(&order, &instrument) {
                if let Some(group) = order.oco_group_id.clone() {
                    ib.register_oco(&group, order.order_id);
                }
                ib.book.insert(resting);
            }
        }

        // Post-trade bookkeeping: last price, trailing anchors, triggers.
        let mut activations = Vec::new();
        if let Some(last_trade) = trades.last() {
            ib.last_trade_price = Some(last_trade.price);
            self.update_trailing_stops(ib, last_trade.price);
            activations = self.collect_triggered(ib, last_trade.price);
        }

        for sibling in &cancelled_siblings {
            self.publish_order(sibling);
        }

        Ok((order, trades, activations))
    }

    /// Settle fills and persist all state transitions in one atomic commit.
    /// Returns the trades and the OCO siblings cancelled by those fills.
    #[allow(clippy::too_many_arguments)]
    async fn settle_and_persist(
        &self,
        instrument: &Instrument,
        order: &mut Order,
        plan: &MatchPlan,
        ib: &InstrumentBook,
        base_seq: u64,
        already_persisted: bool,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Trade>, Vec<Order>)> {
        let cfg = self.config.snapshot();
        let taken_qty = lots_to_qty(plan.taken_lots, instrument.lot_size);
        let remaining_after = (order.remaining - taken_qty).max(0.0);

        let final_status = if remaining_after <= f64::EPSILON {
            OrderStatus::Filled
        } else if order.time_in_force.rests() && order.order_type != OrderType::Market {
            if taken_qty > 0.0 {
                OrderStatus::Partial
            } else {
                OrderStatus::Pending
            }
        } else {
            // Market remainder and IOC remainder are cancelled.
            OrderStatus::Cancelled
        };

        // OCO groups hit by these fills (the filled member survives).
        let mut sibling_ids: HashSet<Uuid> = HashSet::new();
        if plan.taken_lots > 0 {
            let mut groups: HashSet<&String> = plan
                .fills
                .iter()
                .filter_map(|f| f.maker_oco_group.as_ref())
                .collect();
            if let Some(own) = order.oco_group_id.as_ref() {
                groups.insert(own);
            }
            let filled_ids: HashSet<Uuid> = plan
                .fills
                .iter()
                .map(|f| f.maker_order_id)
                .chain(std::iter::once(order.order_id))
                .collect();
            for group in groups {
                if let Some(members) = ib.oco.get(group) {
                    sibling_ids
                        .extend(members.iter().copied().filter(|id| !filled_ids.contains(id)));
                }
            }
        }

        let mut users: Vec<Uuid> = plan.fills.iter().map(|f| f.maker_user_id).collect();
        users.push(order.user_id);

        let margin = self.margin.clone();
        let instrument = instrument.clone();
        let plan = plan.clone();
        let taker = order.clone();
        let sibling_ids: Vec<Uuid> = sibling_ids.into_iter().collect();
        let maker_fee_bp = cfg.maker_fee_bp;
        let taker_fee_bp = cfg.taker_fee_bp;

        let (trades, siblings) = self
            .db
            .with_users_tx(users, move |tx| {
                if !already_persisted {
                    store::insert_order(tx, &taker)?;
                }

                let mut trades = Vec::with_capacity(plan.fills.len());
                for (offset, fill) in plan.fills.iter().enumerate() {
                    let maker_order = store::get_order(tx, fill.maker_order_id)?
                        .ok_or_else(|| MarketError::NotFound("maker order".into()))?;

                    let price = ticks_to_price(fill.price_ticks, instrument.tick_size);
                    let qty = lots_to_qty(fill.lots, instrument.lot_size);
                    let notional = (price * qty).round() as i64;
                    let taker_fee = fee_bdt(notional, taker_fee_bp);
                    let maker_fee = fee_bdt(notional, maker_fee_bp);

                    settle_party(
                        tx, &margin, &instrument, taker.user_id, taker.side, qty, price,
                        notional, taker_fee, taker.leverage, now,
                    )?;
                    settle_party(
                        tx,
                        &margin,
                        &instrument,
                        maker_order.user_id,
                        maker_order.side,
                        qty,
                        price,
                        notional,
                        maker_fee,
                        maker_order.leverage,
                        now,
                    )?;

                    let (buy_order, sell_order, buyer, seller) = match taker.side {
                        OrderSide::Buy => (
                            taker.order_id,
                            maker_order.order_id,
                            taker.user_id,
                            maker_order.user_id,
                        ),
                        OrderSide::Sell => (
                            maker_order.order_id,
                            taker.order_id,
                            maker_order.user_id,
                            taker.user_id,
                        ),
                    };

                    let trade = Trade {
                        trade_id: Uuid::new_v4(),
                        instrument_id: instrument.instrument_id,
                        seq: base_seq + offset as u64 + 1,
                        buy_order_id: buy_order,
                        sell_order_id: sell_order,
                        buyer_id: buyer,
                        seller_id: seller,
                        price,
                        quantity: qty,
                        taker_fee_bdt: taker_fee,
                        maker_fee_bdt: maker_fee,
                        executed_at: now,
                    };
                    store::insert_trade(tx, &trade)?;
                    trades.push(trade);

                    let maker_remaining =
                        lots_to_qty(fill.maker_remaining_lots, instrument.lot_size);
                    let maker_status = if fill.maker_exhausted {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::Partial
                    };
                    store::update_order_state(
                        tx,
                        maker_order.order_id,
                        maker_status,
                        maker_remaining,
                        now,
                    )?;
                }

                store::update_order_state(
                    tx,
                    taker.order_id,
                    final_status,
                    (taker.remaining - lots_to_qty(plan.taken_lots, instrument.lot_size)).max(0.0),
                    now,
                )?;

                // Cancel OCO siblings in the same commit.
                let mut siblings = Vec::new();
                for sibling_id in &sibling_ids {
                    if let Some(sibling) = store::get_order(tx, *sibling_id)? {
                        if !sibling.status.is_terminal() {
                            store::update_order_state(
                                tx,
                                *sibling_id,
                                OrderStatus::Cancelled,
                                sibling.remaining,
                                now,
                            )?;
                            siblings.push(Order {
                                status: OrderStatus::Cancelled,
                                updated_at: now,
                                ..sibling
                            });
                        }
                    }
                }

                Ok((trades, siblings))
            })
            .await?;

        order.remaining = remaining_after;
        order.status = final_status;
        order.updated_at = now;
        Ok((trades, siblings))
    }

    /// Remove a cancelled order from the book, the dormant list and the OCO
    /// index.
    fn remove_from_memory(&self, ib: &mut InstrumentBook, order: &Order) {
        ib.book.cancel(order.order_id);
        ib.dormant.retain(|d| d.order.order_id != order.order_id);
        if let Some(group) = order.oco_group_id.as_ref() {
            let group = group.clone();
            ib.drop_oco_member(&group, order.order_id);
        }
    }

    /// Trailing stops track the most favorable post-placement price.
    fn update_trailing_stops(&self, ib: &mut InstrumentBook, last_price: f64) {
        for dormant in &mut ib.dormant {
            if dormant.order.order_type != OrderType::TrailingStop {
                continue;
            }
            let offset = dormant.order.trailing_offset.unwrap_or(0.0);
            match dormant.order.side {
                OrderSide::Buy => {
                    let best = dormant.best_seen.map(|b| b.min(last_price)).unwrap_or(last_price);
                    dormant.best_seen = Some(best);
                    dormant.trigger = best + offset;
                }
                OrderSide::Sell => {
                    let best = dormant.best_seen.map(|b| b.max(last_price)).unwrap_or(last_price);
                    dormant.best_seen = Some(best);
                    dormant.trigger = best - offset;
                }
            }
        }
    }

    /// Pull triggered stops off the dormant list, in trigger-price order.
    fn collect_triggered(&self, ib: &mut InstrumentBook, last_price: f64) -> Vec<Order> {
        let mut triggered: Vec<DormantStop> = Vec::new();
        ib.dormant.retain(|dormant| {
            let fires = match dormant.order.side {
                OrderSide::Buy => last_price >= dormant.trigger,
                OrderSide::Sell => last_price <= dormant.trigger,
            };
            if fires {
                triggered.push(dormant.clone());
                false
            } else {
                true
            }
        });
        triggered.sort_by(|a, b| a.trigger.total_cmp(&b.trigger));
        triggered
            .into_iter()
            .map(|dormant| {
                let mut order = dormant.order;
                // Stop and trailing-stop activate as market orders;
                // stop-limit becomes a limit at its supplied price.
                match order.order_type {
                    OrderType::StopLimit => order.order_type = OrderType::Limit,
                    _ => {
                        order.order_type = OrderType::Market;
                        order.price = None;
                    }
                }
                order
            })
            .collect()
    }

    /// Run triggered stops as taker orders; their own prints can trigger
    /// further stops, processed breadth-first.
    async fn run_activations(&self, ib: &mut InstrumentBook, mut queue: Vec<Order>) {
        while let Some(activated) = queue.pop() {
            info!(order = %activated.order_id, "▶️ Stop order triggered");
            match self.run_taker(ib, activated, true).await {
                Ok((placed, trades, more)) => {
                    self.publish_match_results(ib, &placed, &trades);
                    queue.extend(more);
                }
                Err(e) => {
                    warn!("Stop activation failed: {e}");
                }
            }
        }
    }

    // === Cancellation ===

    pub async fn cancel_order(&self, user_id: Uuid, order_id: Uuid) -> Result<Order> {
        self.cancel_order_as(Some(user_id), order_id).await
    }

    async fn cancel_order_as(&self, user_id: Option<Uuid>, order_id: Uuid) -> Result<Order> {
        let found = self.db.with_tx(move |tx| store::get_order(tx, order_id)).await?;
        let order = found.ok_or_else(|| MarketError::NotFound("order".into()))?;
        if let Some(user) = user_id {
            if order.user_id != user {
                return Err(MarketError::NotFound("order".into()));
            }
        }
        if order.status.is_terminal() {
            return Err(MarketError::Conflict("order already terminal".into()));
        }

        let instrument = self.instruments.get(order.instrument_id).await?;
        let handle = self.book_handle(&instrument).await?;
        let mut ib = handle.lock().await;

        let now = self.clock.now();
        self.db
            .with_tx(move |tx| {
                let current = store::get_order(tx, order_id)?
                    .ok_or_else(|| MarketError::NotFound("order".into()))?;
                if current.status.is_terminal() {
                    return Err(MarketError::Conflict("order already terminal".into()));
                }
                store::update_order_state(
                    tx,
                    order_id,
                    OrderStatus::Cancelled,
                    current.remaining,
                    now,
                )
            })
            .await?;

        let cancelled = Order { status: OrderStatus::Cancelled, updated_at: now, ..order };
        self.remove_from_memory(&mut ib, &cancelled);
        drop(ib);
        self.publish_order(&cancelled);
        self.publish_book(&instrument).await;
        Ok(cancelled)
    }

    /// Cancel every open order of a user (liquidation path).
    pub async fn cancel_all_for_user(&self, user_id: Uuid) -> Result<usize> {
        let open = self.db.with_tx(move |tx| store::open_orders_for_user(tx, user_id)).await?;
        let mut cancelled = 0usize;
        for order in open {
            match self.cancel_order_as(None, order.order_id).await {
                Ok(_) => cancelled += 1,
                Err(MarketError::Conflict(_)) => {}
                Err(e) => warn!(order = %order.order_id, "Cancel during liquidation failed: {e}"),
            }
        }
        Ok(cancelled)
    }

    /// Cancel resting DAY orders from previous trading days.
    pub async fn sweep_day_orders(&self) -> Result<usize> {
        let day_start = self
            .clock
            .now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| chrono::Utc.from_utc_datetime(&d))
            .unwrap_or_else(|| self.clock.now());

        let expired: Vec<Uuid> = self
            .db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT order_id FROM orders
                     WHERE time_in_force = 'day' AND status IN ('pending', 'partial')
                       AND created_at < ?1",
                )?;
                let rows = stmt
                    .query_map([day_start.to_rfc3339()], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows.into_iter().filter_map(|s| Uuid::parse_str(&s).ok()).collect())
            })
            .await?;

        let mut swept = 0usize;
        for order_id in expired {
            if self.cancel_order_as(None, order_id).await.is_ok() {
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "🌙 Expired DAY orders cancelled");
        }
        Ok(swept)
    }

    // === Helpers ===

    async fn account_leverage_max(&self, user_id: Uuid) -> Result<f64> {
        self.db
            .with_conn(move |conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT leverage_max FROM users WHERE user_id = ?1",
                    [user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| MarketError::NotFound("user".into()))
            })
            .await
    }

    /// Price used by risk checks: the limit price when present, else the
    /// pricing-engine estimate.
    fn reference_price(&self, instrument: &Instrument, request: &PlaceOrder) -> Result<f64> {
        if let Some(price) = request.price {
            return Ok(price);
        }
        if let Some(stop) = request.stop_price {
            return Ok(stop);
        }
        self.pricing
            .mark_price(instrument.instrument_id, instrument.tick_size)
            .ok_or_else(|| {
                MarketError::validation("unable to determine a market price for validation")
            })
    }

    fn publish_order(&self, order: &Order) {
        self.hub.broadcast(
            &format!("orders:{}", order.user_id),
            &json!({
                "type": "order_update",
                "timestamp": order.updated_at.to_rfc3339(),
                "order": order,
            }),
        );
    }

    fn publish_match_results(&self, ib: &InstrumentBook, order: &Order, trades: &[Trade]) {
        self.publish_order(order);
        let instrument = &ib.instrument;

        for trade in trades {
            self.pricing.record_trade(
                instrument.instrument_id,
                trade.price,
                trade.quantity,
                trade.executed_at,
            );
            self.hub.broadcast(
                &format!("trades:{}", instrument.instrument_id),
                &json!({
                    "type": "trade",
                    "timestamp": trade.executed_at.to_rfc3339(),
                    "trade": trade,
                }),
            );
        }

        let now = self.clock.now();
        let to_price = |entry: Option<(PriceTicks, i64, usize)>| {
            entry.map(|(ticks, lots, orders)| {
                json!({
                    "price": ticks_to_price(ticks, instrument.tick_size),
                    "quantity": lots_to_qty(lots, instrument.lot_size),
                    "orders": orders,
                })
            })
        };
        self.hub.broadcast(
            &format!("quote:{}", instrument.instrument_id),
            &json!({
                "type": "book_quote",
                "timestamp": now.to_rfc3339(),
                "instrument_id": instrument.instrument_id,
                "best_bid": to_price(ib.book.best_bid()),
                "best_ask": to_price(ib.book.best_ask()),
                "last_price": ib.last_trade_price,
            }),
        );

        self.publish_depth_rooms(ib, now);
    }

    /// Publish the current book state after a cancel.
    async fn publish_book(&self, instrument: &Instrument) {
        let Ok(handle) = self.book_handle(instrument).await else { return };
        let ib = handle.lock().await;
        self.publish_depth_rooms(&ib, self.clock.now());
    }

    /// Depth rooms are parameterized (`depth:{id}:{levels}`); each active
    /// room gets a payload tailored to its level count.
    fn publish_depth_rooms(&self, ib: &InstrumentBook, now: DateTime<Utc>) {
        let instrument = &ib.instrument;
        let prefix = format!("depth:{}", instrument.instrument_id);
        for room in self.hub.rooms_matching(&prefix) {
            let levels = room
                .rsplit(':')
                .next()
                .and_then(|raw| raw.parse::<usize>().ok())
                .unwrap_or(10)
                .clamp(1, 50);
            let (bids, asks) = ib.book.depth(levels);
            let render = |levels: Vec<DepthLevel>| -> Vec<serde_json::Value> {
                levels
                    .into_iter()
                    .map(|level| {
                        json!({
                            "price": ticks_to_price(level.price_ticks, instrument.tick_size),
                            "quantity": lots_to_qty(level.lots, instrument.lot_size),
                            "orders": level.orders,
                        })
                    })
                    .collect()
            };
            self.hub.broadcast(
                &room,
                &json!({
                    "type": "depth",
                    "timestamp": now.to_rfc3339(),
                    "instrument_id": instrument.instrument_id,
                    "bids": render(bids),
                    "asks": render(asks),
                }),
            );
        }
    }
}

/// Fee in minor units for a notional at the given basis points. Negative
/// basis points (maker rebate) produce a negative fee.
fn fee_bdt(notional: i64, bp: f64) -> i64 {
    (notional as f64 * bp / 10_000.0).round() as i64
}

/// Cash or margin settlement for one side of a fill, inside the commit.
#[allow(clippy::too_many_arguments)]
fn settle_party(
    tx: &rusqlite::Transaction<'_>,
    margin: &MarginService,
    instrument: &Instrument,
    user_id: Uuid,
    side: OrderSide,
    qty: f64,
    price: f64,
    notional: i64,
    fee: i64,
    leverage: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    if leverage > 1.0 {
        margin.apply_fill(tx, user_id, instrument.instrument_id, side, qty, price, leverage, now)?;
        // Fees settle in cash either way.
        if fee > 0 {
            ledger::debit_balance(tx, user_id, fee, now)?;
        } else if fee < 0 {
            ledger::credit_balance(tx, user_id, -fee, now)?;
        }
        return Ok(());
    }

    let delta = match side {
        OrderSide::Buy => -notional - fee,
        OrderSide::Sell => notional - fee,
    };
    if delta >= 0 {
        ledger::credit_balance(tx, user_id, delta, now)?;
    } else {
        ledger::debit_balance(tx, user_id, -delta, now)?;
    }
    Ok(())
}

/// Build the book-resident form of a rest-capable order.
fn resting_from_order(order: &Order, instrument: &Instrument) -> Option<RestingOrder> {
    let price = order.price?;
    let ticks = price_to_ticks(price, instrument.tick_size)?;
    let total = qty_to_lots(order.remaining, instrument.lot_size)?;

    let (visible, hidden, slice) = match order.iceberg_visible {
        Some(visible_qty) if order.order_type == OrderType::Iceberg => {
            let slice = qty_to_lots(visible_qty, instrument.lot_size)?;
            let visible = slice.min(total);
            (visible, total - visible, slice)
        }
        _ => (total, 0, 0),
    };

    Some(RestingOrder {
        order_id: order.order_id,
        user_id: order.user_id,
        side: order.side,
        price_ticks: ticks,
        visible_lots: visible,
        hidden_lots: hidden,
        slice_lots: slice,
        oco_group: order.oco_group_id.clone(),
    })
}
