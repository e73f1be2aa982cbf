//! End-to-end biome market scenarios: redistribution, conservation, and
//! the cross-engine debit race.

mod common;

use common::*;
use terramarket_backend::biome::{Biome, ALL_BIOMES, ROOM_ALL};
use terramarket_backend::config::ConfigSnapshot;
use terramarket_backend::ledger::{TxInsert, TxType};

/// E5: attention on one biome pulls cash toward it, the price-move cap
/// bounds every move, attention resets, and an update reaches the
/// `biome_market_all` room.
#[tokio::test]
async fn test_redistribution_cycle() {
    let stack = stack().await;
    let user = create_user(&stack.db, 0).await;

    // Observe the broadcast like a subscribed client would.
    let (conn, mut rx) = stack.hub.attach();
    stack.hub.subscribe(conn, ROOM_ALL);

    stack.biome.track_attention(user, Biome::Ocean, 1.0).await.unwrap();
    let result = stack.biome.redistribute().await.unwrap();
    assert!(result.redistributed);
    assert_eq!(result.pool, 700_000); // 10% of 7_000_000
    assert_eq!(result.total_attention, 1.0);

    let markets = stack.biome.markets().await.unwrap();
    for market in &markets {
        // Invariant: every price move stays within ±max_price_move_percent.
        let ratio = market.share_price_bdt / 100.0;
        assert!(
            (0.95 - 1e-9..=1.05 + 1e-9).contains(&ratio),
            "{} moved {ratio}",
            market.biome.as_str()
        );
        assert_eq!(market.attention, 0.0);
    }
    let ocean = markets.iter().find(|m| m.biome == Biome::Ocean).unwrap();
    let beach = markets.iter().find(|m| m.biome == Biome::Beach).unwrap();
    assert!(ocean.share_price_bdt > beach.share_price_bdt);

    // The room got a biome_market_update event.
    let event = rx.try_recv().expect("broadcast reached the room");
    assert!(event.contains("biome_market_update"));
}

/// track(u,b,s1) then track(u,b,s2) behaves exactly like track(u,b,s1+s2)
/// in every downstream observation.
#[tokio::test]
async fn test_attention_additivity() {
    let split = stack().await;
    let lump = stack().await;
    let user_a = create_user(&split.db, 0).await;
    let user_b = create_user(&lump.db, 0).await;

    split.biome.track_attention(user_a, Biome::Forest, 0.75).await.unwrap();
    split.biome.track_attention(user_a, Biome::Forest, 0.25).await.unwrap();
    lump.biome.track_attention(user_b, Biome::Forest, 1.0).await.unwrap();

    let split_result = split.biome.redistribute().await.unwrap();
    let lump_result = lump.biome.redistribute().await.unwrap();
    assert_eq!(split_result.total_attention, lump_result.total_attention);

    let split_markets = split.biome.markets().await.unwrap();
    let lump_markets = lump.biome.markets().await.unwrap();
    for (a, b) in split_markets.iter().zip(lump_markets.iter()) {
        assert_eq!(a.cash_bdt, b.cash_bdt, "{} diverged", a.biome.as_str());
    }
}

/// Conservation of funds: user balances + platform fees + market cash is
/// constant across a buy/sell pair (no external payment involved).
#[tokio::test]
async fn test_conservation_across_buy_sell() {
    let stack = stack_with(ConfigSnapshot::default()).await;
    let user = create_user(&stack.db, 100_000).await;

    let market_cash_before: i64 =
        stack.biome.markets().await.unwrap().iter().map(|m| m.cash_bdt).sum();
    let total_before = 100_000 + market_cash_before;

    let buy = stack.biome.buy(user, Biome::Plains, 20_000).await.unwrap();
    let sell = stack
        .biome
        .sell(user, Biome::Plains, buy.shares.unwrap())
        .await
        .unwrap();

    let market_cash_after: i64 =
        stack.biome.markets().await.unwrap().iter().map(|m| m.cash_bdt).sum();
    let balance_after = balance_of(&stack, user).await;
    let platform_revenue = buy.platform_fee_bdt + sell.platform_fee_bdt;

    let total_after = balance_after + platform_revenue + market_cash_after;
    assert!(
        (total_after - total_before).abs() <= 1,
        "conservation violated: {total_before} -> {total_after}"
    );
}

/// E6: a biome buy and a marketplace debit race on one balance; exactly
/// one succeeds and exactly one completed row lands in the ledger.
#[tokio::test]
async fn test_concurrent_debit_race() {
    let stack = stack_with(ConfigSnapshot::default()).await;
    let user = create_user(&stack.db, 10_000).await;

    let biome_engine = stack.biome.clone();
    let ledger = stack.ledger.clone();
    let (biome_result, marketplace_result) = tokio::join!(
        biome_engine.buy(user, Biome::Ocean, 6_000),
        ledger.debit(user, 6_000, TxType::MarketplaceBuyNow, TxInsert::default()),
    );

    let successes =
        [biome_result.is_ok(), marketplace_result.is_ok()].iter().filter(|&&ok| ok).count();
    assert_eq!(successes, 1, "exactly one of the racing debits must win");

    let balance = balance_of(&stack, user).await;
    assert!(balance >= 0);

    let (rows, _) = stack.ledger.transactions(user, None, 1, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
}

/// Every holding keeps shares >= 0, and zero shares means zero invested.
#[tokio::test]
async fn test_holding_invariant_after_partial_sells() {
    let stack = stack_with(ConfigSnapshot::default()).await;
    let user = create_user(&stack.db, 100_000).await;

    let buy = stack.biome.buy(user, Biome::Mountain, 10_000).await.unwrap();
    let shares = buy.shares.unwrap();

    stack.biome.sell(user, Biome::Mountain, shares / 2.0).await.unwrap();
    let portfolio = stack.biome.portfolio(user).await.unwrap();
    let holding = portfolio.holdings.iter().find(|h| h.biome == Biome::Mountain).unwrap();
    assert!(holding.shares > 0.0);
    assert!(holding.total_invested_bdt > 0);
    // Average price is preserved by proportional reduction.
    assert!((holding.average_buy_price_bdt - 100.0).abs() < 0.01);

    stack.biome.sell(user, Biome::Mountain, holding.shares).await.unwrap();
    let portfolio = stack.biome.portfolio(user).await.unwrap();
    assert!(portfolio.holdings.iter().all(|h| h.biome != Biome::Mountain));
}

/// The per-biome transaction history filters and paginates.
#[tokio::test]
async fn test_transaction_history_filtering() {
    let stack = stack_with(ConfigSnapshot::default()).await;
    let user = create_user(&stack.db, 200_000).await;

    stack.biome.buy(user, Biome::Ocean, 10_000).await.unwrap();
    stack.biome.buy(user, Biome::Desert, 10_000).await.unwrap();
    stack.biome.buy(user, Biome::Ocean, 5_000).await.unwrap();

    let (ocean_rows, _) =
        stack.biome.transactions(user, Some(Biome::Ocean), 1, 10).await.unwrap();
    assert_eq!(ocean_rows.len(), 2);
    assert!(ocean_rows.iter().all(|r| r.biome.as_deref() == Some("ocean")));

    let (all_rows, total) = stack.biome.transactions(user, None, 1, 10).await.unwrap();
    assert_eq!(all_rows.len(), 3);
    assert_eq!(total, 3);
}

/// Redistribution ticks leave total cash invariant when no clamp binds.
#[tokio::test]
async fn test_redistribution_conserves_cash_with_mild_attention() {
    let mut cfg = common::zero_fee_config();
    // Small pool keeps every price move inside the cap.
    cfg.redistribution_pool_percent = 1.0;
    cfg.max_price_move_percent = 5.0;
    let stack = stack_with(cfg).await;
    let user = create_user(&stack.db, 0).await;

    for biome in ALL_BIOMES {
        stack.biome.track_attention(user, biome, 1.0).await.unwrap();
    }
    stack.biome.track_attention(user, Biome::Snow, 0.5).await.unwrap();

    let before: i64 = stack.biome.markets().await.unwrap().iter().map(|m| m.cash_bdt).sum();
    stack.biome.redistribute().await.unwrap();
    let after: i64 = stack.biome.markets().await.unwrap().iter().map(|m| m.cash_bdt).sum();
    assert_eq!(before, after);
}
