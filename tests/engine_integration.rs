//! End-to-end matching engine scenarios against the full stack.

mod common;

use common::*;
use terramarket_backend::market::store;
use terramarket_backend::market::types::{
    OrderSide, OrderStatus, OrderType, PlaceOrder, TimeInForce, VenueStatus,
};
use uuid::Uuid;

fn order(
    instrument: Uuid,
    side: OrderSide,
    order_type: OrderType,
    qty: f64,
    price: Option<f64>,
) -> PlaceOrder {
    PlaceOrder {
        instrument_id: instrument,
        side,
        order_type,
        quantity: qty,
        price,
        stop_price: None,
        trailing_offset: None,
        iceberg_visible: None,
        oco_group_id: None,
        time_in_force: TimeInForce::Gtc,
        client_order_id: None,
        leverage: 1.0,
    }
}

/// E1: resting limit sell, incoming market buy, one trade at the maker's
/// price, cash settled exactly with zero fees.
#[tokio::test]
async fn test_limit_then_market() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let seller = create_user(&stack.db, 1_000).await;
    let buyer = create_user(&stack.db, 1_000).await;

    let sell = stack
        .engine
        .place_order(seller, order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(10.0)))
        .await
        .unwrap();
    assert_eq!(sell.status, OrderStatus::Pending);

    // Market orders validate against the pricing-engine estimate.
    stack.pricing.ingest_quote(instrument.instrument_id, "lp-a", 10.0, 10.0, 10.0, 10.0);

    let buy = stack
        .engine
        .place_order(buyer, order(instrument.instrument_id, OrderSide::Buy, OrderType::Market, 1.0, None))
        .await
        .unwrap();
    assert_eq!(buy.status, OrderStatus::Filled);
    assert_eq!(buy.remaining, 0.0);

    let trades = stack
        .db
        .with_tx(move |tx| store::list_trades(tx, Some(instrument.instrument_id), 10, 0))
        .await
        .unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, 10.0);
    assert_eq!(trades[0].quantity, 1.0);
    assert_eq!(trades[0].seq, 1);

    let sell_after = stack
        .db
        .with_tx(move |tx| store::get_order(tx, sell.order_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sell_after.status, OrderStatus::Filled);

    assert_eq!(balance_of(&stack, buyer).await, 990);
    assert_eq!(balance_of(&stack, seller).await, 1_010);
}

/// E2: FOK with insufficient aggregate liquidity cancels entirely, zero
/// trades, book untouched.
#[tokio::test]
async fn test_fok_insufficient_liquidity() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let seller = create_user(&stack.db, 0).await;
    let buyer = create_user(&stack.db, 1_000).await;

    stack
        .engine
        .place_order(seller, order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(10.0)))
        .await
        .unwrap();

    let mut fok = order(instrument.instrument_id, OrderSide::Buy, OrderType::Limit, 2.0, Some(10.0));
    fok.time_in_force = TimeInForce::Fok;
    let result = stack.engine.place_order(buyer, fok).await.unwrap();
    assert_eq!(result.status, OrderStatus::Cancelled);

    let trades = stack
        .db
        .with_tx(move |tx| store::list_trades(tx, Some(instrument.instrument_id), 10, 0))
        .await
        .unwrap();
    assert!(trades.is_empty());

    // Book unchanged: the 1-lot ask still rests.
    let (_, best_ask, _) = stack.engine.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_ask, Some((10.0, 1.0)));
    assert_eq!(balance_of(&stack, buyer).await, 1_000);
}

/// E3: any fill in an OCO group cancels the siblings immediately.
#[tokio::test]
async fn test_oco_cancels_sibling() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let maker = create_user(&stack.db, 0).await;
    let buyer = create_user(&stack.db, 1_000).await;

    let mut low = order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(10.0));
    low.oco_group_id = Some("G".into());
    let mut high = order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(11.0));
    high.oco_group_id = Some("G".into());

    let low = stack.engine.place_order(maker, low).await.unwrap();
    let high = stack.engine.place_order(maker, high).await.unwrap();

    stack.pricing.ingest_quote(instrument.instrument_id, "lp-a", 10.0, 10.0, 10.0, 10.0);
    stack
        .engine
        .place_order(buyer, order(instrument.instrument_id, OrderSide::Buy, OrderType::Market, 1.0, None))
        .await
        .unwrap();

    let low_after = stack.db.with_tx(move |tx| store::get_order(tx, low.order_id)).await.unwrap().unwrap();
    let high_after =
        stack.db.with_tx(move |tx| store::get_order(tx, high.order_id)).await.unwrap().unwrap();
    assert_eq!(low_after.status, OrderStatus::Filled);
    assert_eq!(high_after.status, OrderStatus::Cancelled);

    // Nothing left on the ask side; no further matching on group G.
    let (_, best_ask, _) = stack.engine.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_ask, None);
}

/// OCO groups never span instruments: reusing a live group id on another
/// instrument is rejected at placement.
#[tokio::test]
async fn test_oco_group_cannot_span_instruments() {
    let stack = stack().await;
    let first = create_instrument(&stack, 0.5, 1.0).await;
    let second = create_instrument(&stack, 0.5, 1.0).await;
    let maker = create_user(&stack.db, 0).await;

    let mut a = order(first.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(10.0));
    a.oco_group_id = Some("G".into());
    stack.engine.place_order(maker, a).await.unwrap();

    let mut b = order(second.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(10.0));
    b.oco_group_id = Some("G".into());
    let err = stack.engine.place_order(maker, b).await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    // Same instrument is fine: the pair links up as siblings.
    let mut c = order(first.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(11.0));
    c.oco_group_id = Some("G".into());
    stack.engine.place_order(maker, c).await.unwrap();
}

/// E4: iceberg replenishes slices from the hidden reserve until exhausted.
#[tokio::test]
async fn test_iceberg_replenishment() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let maker = create_user(&stack.db, 0).await;
    let buyer = create_user(&stack.db, 10_000).await;

    let mut iceberg =
        order(instrument.instrument_id, OrderSide::Sell, OrderType::Iceberg, 5.0, Some(10.0));
    iceberg.iceberg_visible = Some(2.0);
    let iceberg = stack.engine.place_order(maker, iceberg).await.unwrap();

    // Only the visible slice shows in the book.
    let (_, best_ask, _) = stack.engine.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_ask, Some((10.0, 2.0)));

    stack.pricing.ingest_quote(instrument.instrument_id, "lp-a", 10.0, 10.0, 10.0, 10.0);

    stack
        .engine
        .place_order(buyer, order(instrument.instrument_id, OrderSide::Buy, OrderType::Market, 3.0, None))
        .await
        .unwrap();
    stack
        .engine
        .place_order(buyer, order(instrument.instrument_id, OrderSide::Buy, OrderType::Market, 2.0, None))
        .await
        .unwrap();

    let trades = stack
        .db
        .with_tx(move |tx| store::list_trades(tx, Some(instrument.instrument_id), 10, 0))
        .await
        .unwrap();
    let total: f64 = trades.iter().map(|t| t.quantity).sum();
    assert_eq!(trades.len(), 2);
    assert_eq!(total, 5.0);

    let iceberg_after =
        stack.db.with_tx(move |tx| store::get_order(tx, iceberg.order_id)).await.unwrap().unwrap();
    assert_eq!(iceberg_after.status, OrderStatus::Filled);

    let (best_bid, best_ask, _) = stack.engine.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_bid, None);
    assert_eq!(best_ask, None);
}

/// Round-trip: placing a non-crossing GTC limit and cancelling it restores
/// the pre-placement book.
#[tokio::test]
async fn test_place_then_cancel_restores_book() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let user = create_user(&stack.db, 1_000).await;

    let placed = stack
        .engine
        .place_order(user, order(instrument.instrument_id, OrderSide::Buy, OrderType::Limit, 1.0, Some(9.0)))
        .await
        .unwrap();
    let (best_bid, _, _) = stack.engine.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_bid, Some((9.0, 1.0)));

    let cancelled = stack.engine.cancel_order(user, placed.order_id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let (best_bid, best_ask, _) = stack.engine.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_bid, None);
    assert_eq!(best_ask, None);
    // No balance motion for an unfilled order.
    assert_eq!(balance_of(&stack, user).await, 1_000);
}

/// Stop order stays dormant until the last trade crosses its stop price,
/// then fires as a market order.
#[tokio::test]
async fn test_stop_triggers_on_trade() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let maker = create_user(&stack.db, 0).await;
    let trader = create_user(&stack.db, 10_000).await;
    let stopper = create_user(&stack.db, 10_000).await;

    // Liquidity above the trigger for the activated stop to consume.
    stack
        .engine
        .place_order(maker, order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(11.5)))
        .await
        .unwrap();
    // The print that will trip the stop.
    stack
        .engine
        .place_order(maker, order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(11.0)))
        .await
        .unwrap();

    let mut stop = order(instrument.instrument_id, OrderSide::Buy, OrderType::Stop, 1.0, None);
    stop.stop_price = Some(11.0);
    let stop = stack.engine.place_order(stopper, stop).await.unwrap();
    assert_eq!(stop.status, OrderStatus::Pending);

    // Nothing traded yet: the stop must not fire.
    let trades = stack
        .db
        .with_tx(move |tx| store::list_trades(tx, Some(instrument.instrument_id), 10, 0))
        .await
        .unwrap();
    assert!(trades.is_empty());

    // Trade at 11 trips the buy stop (last >= stop).
    stack.pricing.ingest_quote(instrument.instrument_id, "lp-a", 11.0, 11.0, 10.0, 10.0);
    stack
        .engine
        .place_order(trader, order(instrument.instrument_id, OrderSide::Buy, OrderType::Market, 1.0, None))
        .await
        .unwrap();

    let stop_after =
        stack.db.with_tx(move |tx| store::get_order(tx, stop.order_id)).await.unwrap().unwrap();
    assert_eq!(stop_after.status, OrderStatus::Filled);

    let trades = stack
        .db
        .with_tx(move |tx| store::list_trades(tx, Some(instrument.instrument_id), 10, 0))
        .await
        .unwrap();
    assert_eq!(trades.len(), 2);
    // Triggered stop consumed the 11.5 ask.
    assert!(trades.iter().any(|t| t.price == 11.5));
    // Sequence numbers strictly increase per instrument.
    let mut seqs: Vec<u64> = trades.iter().map(|t| t.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2]);
}

/// Orders are rejected while the venue is halted; book queries keep
/// working.
#[tokio::test]
async fn test_halted_market_rejects_orders() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let user = create_user(&stack.db, 1_000).await;

    stack
        .engine
        .place_order(user, order(instrument.instrument_id, OrderSide::Buy, OrderType::Limit, 1.0, Some(9.0)))
        .await
        .unwrap();

    stack
        .engine
        .set_venue_status(VenueStatus::Halted, Some("maintenance".into()), None)
        .await
        .unwrap();

    let err = stack
        .engine
        .place_order(user, order(instrument.instrument_id, OrderSide::Buy, OrderType::Limit, 1.0, Some(9.0)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MARKET_NOT_OPEN");

    // Book state still reported.
    let (best_bid, _, _) = stack.engine.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_bid, Some((9.0, 1.0)));
}

/// Idempotency: re-submitting the same client_order_id returns the
/// original order instead of double-placing.
#[tokio::test]
async fn test_client_order_id_idempotency() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let user = create_user(&stack.db, 1_000).await;

    let mut request = order(instrument.instrument_id, OrderSide::Buy, OrderType::Limit, 1.0, Some(9.0));
    request.client_order_id = Some("co-1".into());

    let first = stack.engine.place_order(user, request.clone()).await.unwrap();
    let second = stack.engine.place_order(user, request).await.unwrap();
    assert_eq!(first.order_id, second.order_id);

    let (best_bid, _, _) = stack.engine.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_bid, Some((9.0, 1.0)));
}

/// A rejected buy (insufficient balance) produces no trades and no balance
/// motion.
#[tokio::test]
async fn test_spot_buy_requires_balance() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let seller = create_user(&stack.db, 0).await;
    let poor = create_user(&stack.db, 5).await;

    stack
        .engine
        .place_order(seller, order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(10.0)))
        .await
        .unwrap();

    let err = stack
        .engine
        .place_order(poor, order(instrument.instrument_id, OrderSide::Buy, OrderType::Limit, 1.0, Some(10.0)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    assert_eq!(balance_of(&stack, poor).await, 5);
}

/// Startup recovery: non-terminal orders re-enter the book, the trade
/// sequence resumes past the highest persisted number.
#[tokio::test]
async fn test_recovery_rebuilds_book() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let maker = create_user(&stack.db, 0).await;
    let buyer = create_user(&stack.db, 10_000).await;

    stack
        .engine
        .place_order(maker, order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 2.0, Some(10.0)))
        .await
        .unwrap();
    stack.pricing.ingest_quote(instrument.instrument_id, "lp-a", 10.0, 10.0, 10.0, 10.0);
    stack
        .engine
        .place_order(buyer, order(instrument.instrument_id, OrderSide::Buy, OrderType::Market, 1.0, None))
        .await
        .unwrap();

    // A second engine over the same store simulates a restart.
    let risk = terramarket_backend::market::RiskEngine::new(stack.config.clone(), stack.margin.clone());
    let fresh = terramarket_backend::market::MatchingEngine::new(
        stack.db.clone(),
        terramarket_backend::clock::Clock::new(),
        stack.config.clone(),
        stack.hub.clone(),
        stack.pricing.clone(),
        stack.margin.clone(),
        risk,
        stack.instruments.clone(),
    );
    fresh.load_venue_status().await.unwrap();
    fresh.recover().await.unwrap();

    // The partially-filled maker rests with its remainder.
    let (_, best_ask, last) = fresh.top_of_book(instrument.instrument_id).await.unwrap();
    assert_eq!(best_ask, Some((10.0, 1.0)));
    assert_eq!(last, Some(10.0));

    // New trade continues the sequence.
    stack.pricing.ingest_quote(instrument.instrument_id, "lp-a", 10.0, 10.0, 10.0, 10.0);
    fresh
        .place_order(buyer, order(instrument.instrument_id, OrderSide::Buy, OrderType::Market, 1.0, None))
        .await
        .unwrap();
    let trades = stack
        .db
        .with_tx(move |tx| store::list_trades(tx, Some(instrument.instrument_id), 10, 0))
        .await
        .unwrap();
    let mut seqs: Vec<u64> = trades.iter().map(|t| t.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2]);
}

/// Leveraged fills open positions instead of settling full notional.
#[tokio::test]
async fn test_leveraged_order_opens_position() {
    let stack = stack().await;
    let instrument = create_instrument(&stack, 0.5, 1.0).await;
    let seller = create_user(&stack.db, 0).await;
    let buyer = create_user(&stack.db, 1_000).await;

    stack
        .engine
        .place_order(seller, order(instrument.instrument_id, OrderSide::Sell, OrderType::Limit, 1.0, Some(100.0)))
        .await
        .unwrap();

    let mut leveraged =
        order(instrument.instrument_id, OrderSide::Buy, OrderType::Limit, 1.0, Some(100.0));
    leveraged.leverage = 10.0;
    let placed = stack.engine.place_order(buyer, leveraged).await.unwrap();
    assert_eq!(placed.status, OrderStatus::Filled);

    // Notional stayed on the account; only the position's margin is used.
    assert_eq!(balance_of(&stack, buyer).await, 1_000);
    let positions = stack.margin.positions(buyer).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].quantity, 1.0);
    assert_eq!(positions[0].margin_used, 10.0); // 100 / 10x

    let metrics = stack.margin.account_metrics(buyer).await.unwrap();
    assert_eq!(metrics.used_margin, 10.0);
}
