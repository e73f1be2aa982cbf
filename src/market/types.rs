//! Order and trade types shared across the matching engine.
//!
//! Prices and quantities cross the API boundary as floats but are converted
//! to integer ticks and lot units at the engine edge; matching is integer
//! arithmetic throughout. The conversion fails when a value is not an exact
//! multiple of the instrument's tick or lot size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer price in ticks of the instrument's tick size.
pub type PriceTicks = i64;
/// Integer quantity in multiples of the instrument's lot size.
pub type QtyLots = i64;

/// Relative tolerance for the exact-multiple check on float inputs.
const ALIGN_EPSILON: f64 = 1e-6;

/// Convert a price to ticks; `None` when not aligned to the tick size.
pub fn price_to_ticks(price: f64, tick_size: f64) -> Option<PriceTicks> {
    if !(price > 0.0) || !(tick_size > 0.0) {
        return None;
    }
    let ratio = price / tick_size;
    let rounded = ratio.round();
    if (ratio - rounded).abs() > ALIGN_EPSILON * ratio.max(1.0) {
        return None;
    }
    Some(rounded as PriceTicks)
}

pub fn ticks_to_price(ticks: PriceTicks, tick_size: f64) -> f64 {
    ticks as f64 * tick_size
}

/// Convert a quantity to lot units; `None` when not aligned to the lot size.
pub fn qty_to_lots(qty: f64, lot_size: f64) -> Option<QtyLots> {
    if !(qty > 0.0) || !(lot_size > 0.0) {
        return None;
    }
    let ratio = qty / lot_size;
    let rounded = ratio.round();
    if (ratio - rounded).abs() > ALIGN_EPSILON * ratio.max(1.0) {
        return None;
    }
    Some(rounded as QtyLots)
}

pub fn lots_to_qty(lots: QtyLots, lot_size: f64) -> f64 {
    lots as f64 * lot_size
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type. IOC and FOK arrive as `time_in_force` values on a limit
/// order; OCO is a limit order carrying a group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
    Iceberg,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TrailingStop => "trailing_stop",
            OrderType::Iceberg => "iceberg",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop" => Some(OrderType::Stop),
            "stop_limit" => Some(OrderType::StopLimit),
            "trailing_stop" => Some(OrderType::TrailingStop),
            "iceberg" => Some(OrderType::Iceberg),
            _ => None,
        }
    }

    /// Dormant until the stop trigger fires.
    pub fn is_stop_family(&self) -> bool {
        matches!(self, OrderType::Stop | OrderType::StopLimit | OrderType::TrailingStop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Gtc,
    Day,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "gtc",
            TimeInForce::Day => "day",
            TimeInForce::Ioc => "ioc",
            TimeInForce::Fok => "fok",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gtc" => Some(TimeInForce::Gtc),
            "day" => Some(TimeInForce::Day),
            "ioc" => Some(TimeInForce::Ioc),
            "fok" => Some(TimeInForce::Fok),
            _ => None,
        }
    }

    pub fn rests(&self) -> bool {
        matches!(self, TimeInForce::Gtc | TimeInForce::Day)
    }
}

/// Order lifecycle. Transitions are monotonic:
/// pending → partial → filled, or → cancelled from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "partial" => Some(OrderStatus::Partial),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Pending, OrderStatus::Partial)
            | (OrderStatus::Pending, OrderStatus::Filled)
            | (OrderStatus::Pending, OrderStatus::Cancelled)
            | (OrderStatus::Partial, OrderStatus::Partial)
            | (OrderStatus::Partial, OrderStatus::Filled)
            | (OrderStatus::Partial, OrderStatus::Cancelled) => true,
            _ => false,
        }
    }
}

/// Full order record, persisted on every state transition.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub instrument_id: Uuid,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub remaining: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub trailing_offset: Option<f64>,
    pub iceberg_visible: Option<f64>,
    pub oco_group_id: Option<String>,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub client_order_id: Option<String>,
    pub leverage: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable trade record with the instrument-scoped sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub trade_id: Uuid,
    pub instrument_id: Uuid,
    pub seq: u64,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub price: f64,
    pub quantity: f64,
    pub taker_fee_bdt: i64,
    pub maker_fee_bdt: i64,
    pub executed_at: DateTime<Utc>,
}

/// Normalized order placement request, after API-level parsing.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub instrument_id: Uuid,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub trailing_offset: Option<f64>,
    pub iceberg_visible: Option<f64>,
    pub oco_group_id: Option<String>,
    pub time_in_force: TimeInForce,
    pub client_order_id: Option<String>,
    pub leverage: f64,
}

/// Venue-wide trading state. While halted or closed, new orders are
/// rejected but book state keeps being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueStatus {
    Open,
    Halted,
    Closed,
}

impl VenueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueStatus::Open => "open",
            VenueStatus::Halted => "halted",
            VenueStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "open" => Some(VenueStatus::Open),
            "halted" => Some(VenueStatus::Halted),
            "closed" => Some(VenueStatus::Closed),
            _ => None,
        }
    }
}
