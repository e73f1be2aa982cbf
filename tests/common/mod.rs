//! Shared scaffolding for integration tests: a fully wired engine stack on
//! an in-memory store, plus helpers to mint users and instruments.

use std::sync::Arc;
use uuid::Uuid;

use terramarket_backend::auth::{api::AuthState, JwtHandler, SessionStore, UserStore};
use terramarket_backend::biome::BiomeMarketEngine;
use terramarket_backend::clock::Clock;
use terramarket_backend::config::{ConfigProvider, ConfigSnapshot};
use terramarket_backend::db::Db;
use terramarket_backend::ledger::Ledger;
use terramarket_backend::market::instruments::{Instrument, InstrumentCreate};
use terramarket_backend::market::{
    InstrumentStore, MarginService, MatchingEngine, RiskEngine,
};
use terramarket_backend::payment::DisabledPaymentGateway;
use terramarket_backend::pricing::PricingEngine;
use terramarket_backend::ws::SubscriptionHub;

pub struct TestStack {
    pub db: Db,
    pub config: Arc<ConfigProvider>,
    pub hub: Arc<SubscriptionHub>,
    pub pricing: Arc<PricingEngine>,
    pub margin: Arc<MarginService>,
    pub engine: Arc<MatchingEngine>,
    pub biome: Arc<BiomeMarketEngine>,
    pub instruments: Arc<InstrumentStore>,
    pub ledger: Ledger,
    pub auth: AuthState,
}

/// Config with fees zeroed so settlement amounts are exact in assertions.
pub fn zero_fee_config() -> ConfigSnapshot {
    let mut cfg = ConfigSnapshot::default();
    cfg.maker_fee_bp = 0.0;
    cfg.taker_fee_bp = 0.0;
    cfg
}

pub async fn stack_with(cfg: ConfigSnapshot) -> TestStack {
    let db = Db::open_in_memory().expect("in-memory db");
    let clock = Clock::new();
    let config = Arc::new(ConfigProvider::new(cfg));
    let hub = Arc::new(SubscriptionHub::new());
    let pricing = Arc::new(PricingEngine::new(config.clone(), clock.clone()));
    let instruments = Arc::new(InstrumentStore::new(db.clone(), clock.clone()));
    let margin = Arc::new(MarginService::new(
        db.clone(),
        clock.clone(),
        config.clone(),
        pricing.clone(),
        instruments.clone(),
    ));
    let risk = RiskEngine::new(config.clone(), margin.clone());
    let engine = Arc::new(MatchingEngine::new(
        db.clone(),
        clock.clone(),
        config.clone(),
        hub.clone(),
        pricing.clone(),
        margin.clone(),
        risk,
        instruments.clone(),
    ));
    engine.load_venue_status().await.expect("venue status");

    let biome = Arc::new(BiomeMarketEngine::new(
        db.clone(),
        clock.clone(),
        config.clone(),
        hub.clone(),
        Arc::new(DisabledPaymentGateway),
    ));
    biome.initialize_markets().await.expect("init biome markets");

    let ledger = Ledger::new(db.clone(), clock.clone());
    let auth = AuthState {
        users: Arc::new(UserStore::new(db.clone(), clock.clone())),
        sessions: Arc::new(SessionStore::new(db.clone())),
        jwt: Arc::new(JwtHandler::new("integration-test-secret".into(), 60, 7)),
        config: config.clone(),
    };

    TestStack { db, config, hub, pricing, margin, engine, biome, instruments, ledger, auth }
}

pub async fn stack() -> TestStack {
    stack_with(zero_fee_config()).await
}

pub async fn create_user(db: &Db, balance: i64) -> Uuid {
    let user = Uuid::new_v4();
    db.with_tx(|tx| {
        tx.execute(
            "INSERT INTO users (user_id, username, email, password_hash, balance_bdt,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, 'hash', ?4, 'now', 'now')",
            rusqlite::params![
                user.to_string(),
                format!("user-{}", &user.to_string()[..8]),
                format!("{}@test.io", &user.to_string()[..8]),
                balance
            ],
        )?;
        Ok(())
    })
    .await
    .expect("insert user");
    user
}

pub async fn create_instrument(stack: &TestStack, tick: f64, lot: f64) -> Instrument {
    stack
        .instruments
        .create(InstrumentCreate {
            symbol: format!("T{}", &Uuid::new_v4().to_string()[..6]),
            asset_class: "equity".into(),
            tick_size: tick,
            lot_size: lot,
            leverage_max: 50.0,
            margin_allowed: true,
            short_allowed: true,
        })
        .await
        .expect("create instrument")
}

pub async fn balance_of(stack: &TestStack, user: Uuid) -> i64 {
    stack.ledger.balance(user).await.expect("balance")
}
