//! REST handlers.
//!
//! Thin layer over the engines: parse the payload, call the operation,
//! shape the response. Errors bubble as `MarketError` and render through
//! the shared envelope.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::api::state::AppState;
use crate::auth::middleware::{AdminOnly, Authed};
use crate::auth::models::Claims;
use crate::biome::Biome;
use crate::error::{MarketError, Result};
use crate::ledger::TxRecord;
use crate::market::instruments::{Instrument, InstrumentCreate, InstrumentPatch};
use crate::market::store::{self, OrderFilter};
use crate::market::types::{
    Order, OrderSide, OrderStatus, OrderType, PlaceOrder, TimeInForce, Trade, VenueStatus,
};
use crate::pricing::{CorporateAction, Timeframe};

fn claims_user(claims: &Claims) -> Result<Uuid> {
    claims
        .user_id()
        .ok_or_else(|| MarketError::Authentication("malformed subject claim".into()))
}

pub async fn health_check() -> &'static str {
    "🚀 TerraMarket operational"
}

// === Instruments ===

pub async fn list_instruments(State(state): State<AppState>) -> Result<Json<Vec<Instrument>>> {
    Ok(Json(state.instruments.list().await?))
}

pub async fn create_instrument(
    State(state): State<AppState>,
    AdminOnly(_claims): AdminOnly,
    Json(payload): Json<InstrumentCreate>,
) -> Result<(StatusCode, Json<Instrument>)> {
    let instrument = state.instruments.create(payload).await?;
    Ok((StatusCode::CREATED, Json(instrument)))
}

pub async fn patch_instrument(
    State(state): State<AppState>,
    AdminOnly(_claims): AdminOnly,
    Path(id): Path<Uuid>,
    Json(payload): Json<InstrumentPatch>,
) -> Result<Json<Instrument>> {
    let instrument = state.instruments.update(id, payload).await?;
    state.hub.broadcast(
        &format!("status:{id}"),
        &json!({
            "type": "instrument_status",
            "timestamp": state.clock.now().to_rfc3339(),
            "instrument_id": id,
            "status": instrument.status,
        }),
    );
    Ok(Json(instrument))
}

pub async fn delete_instrument(
    State(state): State<AppState>,
    AdminOnly(_claims): AdminOnly,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.instruments.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Market status ===

#[derive(Debug, Serialize)]
pub struct MarketStatusResponse {
    pub status: VenueStatus,
    pub reason: Option<String>,
    pub timestamp: String,
}

pub async fn get_market_status(State(state): State<AppState>) -> Json<MarketStatusResponse> {
    let (status, reason) = state.engine.venue_status();
    Json(MarketStatusResponse {
        status,
        reason,
        timestamp: state.clock.now().to_rfc3339(),
    })
}

#[derive(Debug, Deserialize)]
pub struct MarketStatusRequest {
    pub state: String,
    pub reason: Option<String>,
}

pub async fn set_market_status(
    State(state): State<AppState>,
    AdminOnly(claims): AdminOnly,
    Json(payload): Json<MarketStatusRequest>,
) -> Result<Json<MarketStatusResponse>> {
    let status = VenueStatus::from_str(&payload.state)
        .ok_or_else(|| MarketError::validation("state must be open, halted or closed"))?;
    state
        .engine
        .set_venue_status(status, payload.reason.clone(), claims.user_id())
        .await?;
    Ok(Json(MarketStatusResponse {
        status,
        reason: payload.reason,
        timestamp: state.clock.now().to_rfc3339(),
    }))
}

// === Orders ===

#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    pub instrument_id: Uuid,
    pub side: String,
    pub order_type: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub trailing_offset: Option<f64>,
    pub iceberg_visible: Option<f64>,
    pub oco_group_id: Option<String>,
    #[serde(default)]
    pub time_in_force: Option<String>,
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub leverage: Option<f64>,
}

pub async fn place_order(
    State(state): State<AppState>,
    Authed(claims): Authed,
    Json(payload): Json<OrderRequest>,
) -> Result<(StatusCode, Json<Order>)> {
    let user_id = claims_user(&claims)?;
    let side = OrderSide::from_str(&payload.side)
        .ok_or_else(|| MarketError::validation("side must be buy or sell"))?;
    let order_type = OrderType::from_str(&payload.order_type)
        .ok_or_else(|| MarketError::validation("unknown order_type"))?;
    let time_in_force = match payload.time_in_force.as_deref() {
        Some(raw) => TimeInForce::from_str(raw)
            .ok_or_else(|| MarketError::validation("unknown time_in_force"))?,
        None => TimeInForce::Gtc,
    };

    let request = PlaceOrder {
        instrument_id: payload.instrument_id,
        side,
        order_type,
        quantity: payload.quantity,
        price: payload.price,
        stop_price: payload.stop_price,
        trailing_offset: payload.trailing_offset,
        iceberg_visible: payload.iceberg_visible,
        oco_group_id: payload.oco_group_id,
        time_in_force,
        client_order_id: payload.client_order_id,
        leverage: payload.leverage.unwrap_or(1.0),
    };

    let order = state.engine.place_order(user_id, request).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

#[derive(Debug, Deserialize)]
pub struct OrderQuery {
    pub instrument_id: Option<Uuid>,
    pub side: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct OrdersResponse {
    pub orders: Vec<Order>,
    pub count: usize,
    pub timestamp: String,
}

pub async fn list_orders(
    State(state): State<AppState>,
    Authed(claims): Authed,
    Query(params): Query<OrderQuery>,
) -> Result<Json<OrdersResponse>> {
    let user_id = claims_user(&claims)?;
    let filter = OrderFilter {
        instrument_id: params.instrument_id,
        side: params.side.as_deref().and_then(OrderSide::from_str),
        status: params.status.as_deref().and_then(OrderStatus::from_str),
        limit: params.limit.unwrap_or(100).min(500),
        offset: params.offset.unwrap_or(0),
    };
    let orders = state
        .db
        .with_tx(move |tx| store::list_user_orders(tx, user_id, &filter))
        .await?;
    Ok(Json(OrdersResponse {
        count: orders.len(),
        orders,
        timestamp: state.clock.now().to_rfc3339(),
    }))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Authed(claims): Authed,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>> {
    let user_id = claims_user(&claims)?;
    let order = state.engine.cancel_order(user_id, order_id).await?;
    Ok(Json(order))
}

// === Trades ===

#[derive(Debug, Deserialize)]
pub struct TradeQuery {
    pub instrument_id: Option<Uuid>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TradesResponse {
    pub trades: Vec<Trade>,
    pub count: usize,
    pub timestamp: String,
}

pub async fn list_trades(
    State(state): State<AppState>,
    Query(params): Query<TradeQuery>,
) -> Result<Json<TradesResponse>> {
    let trades = state
        .db
        .with_tx(move |tx| {
            store::list_trades(
                tx,
                params.instrument_id,
                params.limit.unwrap_or(100).min(500),
                params.offset.unwrap_or(0),
            )
        })
        .await?;
    Ok(Json(TradesResponse {
        count: trades.len(),
        trades,
        timestamp: state.clock.now().to_rfc3339(),
    }))
}

// === Market data ===

pub async fn get_quote(
    State(state): State<AppState>,
    Path(instrument_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let instrument = state.instruments.get(instrument_id).await?;
    let quote = state
        .pricing
        .aggregated(instrument_id, instrument.tick_size)
        .ok_or_else(|| MarketError::NotFound("quote".into()))?;
    Ok(Json(json!(quote)))
}

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    pub levels: Option<usize>,
}

pub async fn get_depth(
    State(state): State<AppState>,
    Path(instrument_id): Path<Uuid>,
    Query(params): Query<DepthQuery>,
) -> Result<Json<serde_json::Value>> {
    let levels = params.levels.unwrap_or(5).clamp(1, 50);
    let (bids, asks) = state.engine.depth(instrument_id, levels).await?;
    Ok(Json(json!({
        "instrument_id": instrument_id,
        "bids": bids,
        "asks": asks,
        "timestamp": state.clock.now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CandleQuery {
    pub timeframe: Option<String>,
    pub limit: Option<usize>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|_| MarketError::validation("timestamps must be ISO-8601"))
}

pub async fn get_candles(
    State(state): State<AppState>,
    Path(instrument_id): Path<Uuid>,
    Query(params): Query<CandleQuery>,
) -> Result<Json<serde_json::Value>> {
    state.instruments.get(instrument_id).await?;
    let timeframe = match params.timeframe.as_deref() {
        Some(raw) => {
            Timeframe::from_str(raw).ok_or_else(|| MarketError::validation("unknown timeframe"))?
        }
        None => Timeframe::M1,
    };
    let start = params.start_time.as_deref().map(parse_instant).transpose()?;
    let end = params.end_time.as_deref().map(parse_instant).transpose()?;

    // Corporate actions adjust history on read.
    let actions: Vec<CorporateAction> = state
        .db
        .with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT factor, effective_at FROM corporate_actions
                 WHERE instrument_id = ?1 ORDER BY effective_at ASC",
            )?;
            let rows = stmt
                .query_map([instrument_id.to_string()], |row| {
                    Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(factor, raw)| {
                    raw.parse::<DateTime<Utc>>()
                        .ok()
                        .map(|effective_at| CorporateAction { factor, effective_at })
                })
                .collect())
        })
        .await?;

    let candles = state.pricing.candles(
        instrument_id,
        timeframe,
        params.limit.unwrap_or(100).clamp(1, 1000),
        start,
        end,
        &actions,
    );
    Ok(Json(json!({
        "instrument_id": instrument_id,
        "timeframe": timeframe.as_str(),
        "candles": candles,
    })))
}

/// Admin ingestion of a liquidity-provider quote.
#[derive(Debug, Deserialize)]
pub struct LpQuoteRequest {
    pub instrument_id: Uuid,
    pub provider: String,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub bid_size: f64,
    #[serde(default)]
    pub ask_size: f64,
}

pub async fn ingest_lp_quote(
    State(state): State<AppState>,
    AdminOnly(_claims): AdminOnly,
    Json(payload): Json<LpQuoteRequest>,
) -> Result<StatusCode> {
    if payload.bid <= 0.0 || payload.ask <= 0.0 || payload.ask < payload.bid {
        return Err(MarketError::validation("quote must satisfy 0 < bid <= ask"));
    }
    state.instruments.get(payload.instrument_id).await?;
    state.pricing.ingest_quote(
        payload.instrument_id,
        &payload.provider,
        payload.bid,
        payload.ask,
        payload.bid_size,
        payload.ask_size,
    );
    Ok(StatusCode::ACCEPTED)
}

// === Wallet ===

#[derive(Debug, Deserialize)]
pub struct TopupRequest {
    pub amount_bdt: i64,
    #[serde(default)]
    pub gateway_reference: Option<String>,
}

pub async fn topup(
    State(state): State<AppState>,
    Authed(claims): Authed,
    Json(payload): Json<TopupRequest>,
) -> Result<(StatusCode, Json<TxRecord>)> {
    let user_id = claims_user(&claims)?;
    let cfg = state.config.snapshot();
    if payload.amount_bdt < cfg.min_topup_bdt || payload.amount_bdt > cfg.max_topup_bdt {
        return Err(MarketError::validation_with(
            "amount outside the allowed top-up range",
            json!({ "amount_bdt": [format!(
                "must be within [{}, {}]",
                cfg.min_topup_bdt, cfg.max_topup_bdt
            )] }),
        ));
    }
    let record = state
        .ledger
        .topup(
            user_id,
            payload.amount_bdt,
            cfg.payment_gateway_name.clone(),
            0,
            payload.gateway_reference,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

// === Biome market ===

pub async fn biome_markets(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let markets = state.biome.markets().await?;
    Ok(Json(json!({
        "markets": markets,
        "timestamp": state.clock.now().to_rfc3339(),
    })))
}

fn parse_biome(raw: &str) -> Result<Biome> {
    Biome::from_str(raw).ok_or_else(|| MarketError::NotFound("biome".into()))
}

pub async fn biome_market(
    State(state): State<AppState>,
    Path(biome): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let biome = parse_biome(&biome)?;
    let market = state.biome.market(biome).await?;
    let history = state.biome.price_history(biome, 50).await?;
    Ok(Json(json!({ "market": market, "price_history": history })))
}

#[derive(Debug, Deserialize)]
pub struct BiomeBuyRequest {
    pub biome: String,
    pub amount_bdt: i64,
}

pub async fn biome_buy(
    State(state): State<AppState>,
    Authed(claims): Authed,
    Json(payload): Json<BiomeBuyRequest>,
) -> Result<(StatusCode, Json<TxRecord>)> {
    let user_id = claims_user(&claims)?;
    let biome = parse_biome(&payload.biome)?;
    let record = state.biome.buy(user_id, biome, payload.amount_bdt).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
pub struct BiomeSellRequest {
    pub biome: String,
    pub shares: f64,
}

pub async fn biome_sell(
    State(state): State<AppState>,
    Authed(claims): Authed,
    Json(payload): Json<BiomeSellRequest>,
) -> Result<(StatusCode, Json<TxRecord>)> {
    let user_id = claims_user(&claims)?;
    let biome = parse_biome(&payload.biome)?;
    let record = state.biome.sell(user_id, biome, payload.shares).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn biome_portfolio(
    State(state): State<AppState>,
    Authed(claims): Authed,
) -> Result<Json<serde_json::Value>> {
    let user_id = claims_user(&claims)?;
    let portfolio = state.biome.portfolio(user_id).await?;
    Ok(Json(json!(portfolio)))
}

#[derive(Debug, Deserialize)]
pub struct BiomeTxQuery {
    pub biome: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn biome_transactions(
    State(state): State<AppState>,
    Authed(claims): Authed,
    Query(params): Query<BiomeTxQuery>,
) -> Result<Json<serde_json::Value>> {
    let user_id = claims_user(&claims)?;
    let biome = params.biome.as_deref().map(parse_biome).transpose()?;
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let (transactions, total) = state.biome.transactions(user_id, biome, page, limit).await?;
    let pages = (total + limit as u64 - 1) / limit as u64;
    Ok(Json(json!({
        "transactions": transactions,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
            "pages": pages,
            "has_next": (page as u64) < pages,
            "has_prev": page > 1,
        }
    })))
}

#[derive(Debug, Deserialize)]
pub struct TrackAttentionRequest {
    pub biome: String,
    pub attention_score: f64,
}

pub async fn track_attention(
    State(state): State<AppState>,
    Authed(claims): Authed,
    Json(payload): Json<TrackAttentionRequest>,
) -> Result<Json<serde_json::Value>> {
    let user_id = claims_user(&claims)?;
    let biome = parse_biome(&payload.biome)?;
    let total = state
        .biome
        .track_attention(user_id, biome, payload.attention_score)
        .await?;
    Ok(Json(json!({
        "biome": biome.as_str(),
        "accumulated_score": total,
        "timestamp": state.clock.now().to_rfc3339(),
    })))
}

// === Margin ===

pub async fn margin_account(
    State(state): State<AppState>,
    Authed(claims): Authed,
) -> Result<Json<serde_json::Value>> {
    let user_id = claims_user(&claims)?;
    let metrics = state.margin.account_metrics(user_id).await?;
    let status = state.margin.account_status(user_id).await?;
    let positions = state.margin.positions(user_id).await?;
    Ok(Json(json!({
        "metrics": metrics,
        "status": status,
        "positions": positions,
    })))
}
