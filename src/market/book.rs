//! Price-time priority order book for one instrument.
//!
//! Bids and asks are tick-keyed `BTreeMap`s of FIFO price levels; an id
//! index gives fast cancels. Matching is two-phase: `plan_match` walks the
//! book read-only and produces the exact fill sequence, `apply_plan` replays
//! it against the live book. The split lets the engine settle fills in the
//! store first and only mutate the book once the commit has succeeded.
//!
//! Iceberg orders rest with a visible slice plus a hidden reserve; when a
//! slice is fully consumed the order is re-queued at the tail of its price
//! level with the next slice.

use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use crate::market::types::{OrderSide, PriceTicks, QtyLots};

#[derive(Debug, Clone)]
pub struct RestingOrder {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub side: OrderSide,
    pub price_ticks: PriceTicks,
    pub visible_lots: QtyLots,
    pub hidden_lots: QtyLots,
    /// Iceberg slice size; 0 for plain orders.
    pub slice_lots: QtyLots,
    pub oco_group: Option<String>,
}

impl RestingOrder {
    pub fn total_lots(&self) -> QtyLots {
        self.visible_lots + self.hidden_lots
    }

    pub fn is_iceberg(&self) -> bool {
        self.slice_lots > 0
    }
}

#[derive(Debug, Clone, Default)]
struct PriceLevel {
    orders: VecDeque<RestingOrder>,
    visible_lots: QtyLots,
}

impl PriceLevel {
    fn push_back(&mut self, order: RestingOrder) {
        self.visible_lots += order.visible_lots;
        self.orders.push_back(order);
    }

    fn remove(&mut self, order_id: Uuid) -> Option<RestingOrder> {
        let pos = self.orders.iter().position(|o| o.order_id == order_id)?;
        let order = self.orders.remove(pos)?;
        self.visible_lots -= order.visible_lots;
        Some(order)
    }

    fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// One planned fill: `lots` against a specific resting order at its price.
/// Fills against the same maker at the same price are merged per match.
#[derive(Debug, Clone)]
pub struct PlannedFill {
    pub maker_order_id: Uuid,
    pub maker_user_id: Uuid,
    pub price_ticks: PriceTicks,
    pub lots: QtyLots,
    /// Maker quantity (visible and hidden) left after this fill.
    pub maker_remaining_lots: QtyLots,
    /// Maker has nothing left after this fill.
    pub maker_exhausted: bool,
    pub maker_oco_group: Option<String>,
}

/// Outcome of a read-only match walk.
#[derive(Debug, Clone, Default)]
pub struct MatchPlan {
    pub fills: Vec<PlannedFill>,
    pub taken_lots: QtyLots,
}

/// Aggregated view of one price level.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DepthLevel {
    pub price_ticks: PriceTicks,
    pub lots: QtyLots,
    pub orders: usize,
}

#[derive(Debug, Default)]
pub struct OrderBook {
    /// Best bid = highest key.
    bids: BTreeMap<PriceTicks, PriceLevel>,
    /// Best ask = lowest key.
    asks: BTreeMap<PriceTicks, PriceLevel>,
    index: HashMap<Uuid, (OrderSide, PriceTicks)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, order_id: Uuid) -> bool {
        self.index.contains_key(&order_id)
    }

    fn side_book(&self, side: OrderSide) -> &BTreeMap<PriceTicks, PriceLevel> {
        match side {
            OrderSide::Buy => &self.bids,
            OrderSide::Sell => &self.asks,
        }
    }

    fn side_book_mut(&mut self, side: OrderSide) -> &mut BTreeMap<PriceTicks, PriceLevel> {
        match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        }
    }

    /// Rest an order at the tail of its price level.
    pub fn insert(&mut self, order: RestingOrder) {
        self.index.insert(order.order_id, (order.side, order.price_ticks));
        self.side_book_mut(order.side)
            .entry(order.price_ticks)
            .or_default()
            .push_back(order);
    }

    /// Remove a resting order, returning it with its remaining quantity.
    pub fn cancel(&mut self, order_id: Uuid) -> Option<RestingOrder> {
        let (side, ticks) = self.index.remove(&order_id)?;
        let book = self.side_book_mut(side);
        let level = book.get_mut(&ticks)?;
        let order = level.remove(order_id);
        if level.is_empty() {
            book.remove(&ticks);
        }
        order
    }

    pub fn best_bid(&self) -> Option<(PriceTicks, QtyLots, usize)> {
        self.bids
            .last_key_value()
            .map(|(&ticks, level)| (ticks, level.visible_lots, level.orders.len()))
    }

    pub fn best_ask(&self) -> Option<(PriceTicks, QtyLots, usize)> {
        self.asks
            .first_key_value()
            .map(|(&ticks, level)| (ticks, level.visible_lots, level.orders.len()))
    }

    /// First `levels` aggregated price levels on each side (visible only).
    pub fn depth(&self, levels: usize) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(levels)
            .map(|(&ticks, level)| DepthLevel {
                price_ticks: ticks,
                lots: level.visible_lots,
                orders: level.orders.len(),
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(levels)
            .map(|(&ticks, level)| DepthLevel {
                price_ticks: ticks,
                lots: level.visible_lots,
                orders: level.orders.len(),
            })
            .collect();
        (bids, asks)
    }

    /// Crossing price levels for a taker, best first.
    fn crossing_levels(
        &self,
        taker_side: OrderSide,
        limit_ticks: Option<PriceTicks>,
    ) -> Vec<PriceTicks> {
        match taker_side {
            OrderSide::Buy => self
                .asks
                .keys()
                .take_while(|&&ask| limit_ticks.map(|limit| ask <= limit).unwrap_or(true))
                .copied()
                .collect(),
            OrderSide::Sell => self
                .bids
                .keys()
                .rev()
                .take_while(|&&bid| limit_ticks.map(|limit| bid >= limit).unwrap_or(true))
                .copied()
                .collect(),
        }
    }

    /// Total opposing liquidity (hidden reserves included) at acceptable
    /// prices. Used by the FOK pre-check.
    pub fn available_lots(
        &self,
        taker_side: OrderSide,
        limit_ticks: Option<PriceTicks>,
    ) -> QtyLots {
        let book = self.side_book(taker_side.opposite());
        self.crossing_levels(taker_side, limit_ticks)
            .into_iter()
            .filter_map(|ticks| book.get(&ticks))
            .map(|level| level.orders.iter().map(|o| o.total_lots()).sum::<QtyLots>())
            .sum()
    }

    /// Read-only match walk: computes the exact fills an incoming order
    /// would receive, simulating iceberg slice refills, without touching
    /// the book. Fills against one maker at one price are merged.
    pub fn plan_match(
        &self,
        taker_side: OrderSide,
        limit_ticks: Option<PriceTicks>,
        lots: QtyLots,
    ) -> MatchPlan {
        let mut plan = MatchPlan::default();
        let mut remaining = lots;
        let book = self.side_book(taker_side.opposite());

        for level_ticks in self.crossing_levels(taker_side, limit_ticks) {
            if remaining == 0 {
                break;
            }
            let Some(level) = book.get(&level_ticks) else { continue };

            // Simulated queue of (order, visible, hidden).
            let mut queue: VecDeque<(RestingOrder, QtyLots, QtyLots)> = level
                .orders
                .iter()
                .map(|o| (o.clone(), o.visible_lots, o.hidden_lots))
                .collect();
            // Merged fill per maker at this level.
            let mut taken_here: HashMap<Uuid, QtyLots> = HashMap::new();
            let mut order_seq: Vec<RestingOrder> = Vec::new();

            while remaining > 0 {
                let Some((maker, visible, hidden)) = queue.pop_front() else { break };
                let take = remaining.min(visible);
                if take > 0 {
                    if !taken_here.contains_key(&maker.order_id) {
                        order_seq.push(maker.clone());
                    }
                    *taken_here.entry(maker.order_id).or_insert(0) += take;
                    remaining -= take;
                }

                let visible_left = visible - take;
                if visible_left > 0 {
                    queue.push_front((maker, visible_left, hidden));
                } else if hidden > 0 {
                    // Slice exhausted: refill at the tail of the level.
                    let slice = maker.slice_lots.min(hidden);
                    queue.push_back((maker, slice, hidden - slice));
                }
            }

            for maker in order_seq {
                let taken = taken_here[&maker.order_id];
                plan.fills.push(PlannedFill {
                    maker_order_id: maker.order_id,
                    maker_user_id: maker.user_id,
                    price_ticks: level_ticks,
                    lots: taken,
                    maker_remaining_lots: maker.total_lots() - taken,
                    maker_exhausted: taken == maker.total_lots(),
                    maker_oco_group: maker.oco_group.clone(),
                });
            }
        }

        plan.taken_lots = lots - remaining;
        plan
    }

    /// Replay a plan against the live book: consume each maker's lots with
    /// the same slice-refill behavior the plan simulated.
    pub fn apply_plan(&mut self, taker_side: OrderSide, plan: &MatchPlan) {
        for fill in &plan.fills {
            self.consume(taker_side.opposite(), fill.maker_order_id, fill.price_ticks, fill.lots);
        }
    }

    /// Consume `lots` from one resting order, handling slice refills and
    /// removal on exhaustion.
    fn consume(
        &mut self,
        maker_side: OrderSide,
        order_id: Uuid,
        ticks: PriceTicks,
        mut lots: QtyLots,
    ) {
        let mut removed_from_index = false;

        let book = self.side_book_mut(maker_side);
        let Some(level) = book.get_mut(&ticks) else { return };

        while lots > 0 {
            let Some(pos) = level.orders.iter().position(|o| o.order_id == order_id) else {
                break;
            };
            let order = &mut level.orders[pos];
            let take = lots.min(order.visible_lots);
            order.visible_lots -= take;
            level.visible_lots -= take;
            lots -= take;

            if order.visible_lots == 0 {
                if order.hidden_lots > 0 {
                    // Refill the next slice and move to the tail.
                    let slice = order.slice_lots.min(order.hidden_lots);
                    order.visible_lots = slice;
                    order.hidden_lots -= slice;
                    level.visible_lots += slice;
                    let refilled = level.orders.remove(pos).unwrap_or_else(|| unreachable!());
                    level.orders.push_back(refilled);
                } else {
                    level.orders.remove(pos);
                    removed_from_index = true;
                }
            }
        }

        if level.is_empty() {
            book.remove(&ticks);
        }

        if removed_from_index {
            self.index.remove(&order_id);
        }
    }
}
