//! Shared application state for the HTTP/WS surface.

use axum::extract::FromRef;
use std::sync::Arc;

use crate::auth::api::AuthState;
use crate::biome::BiomeMarketEngine;
use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::db::Db;
use crate::ledger::Ledger;
use crate::market::{InstrumentStore, MarginService, MatchingEngine};
use crate::middleware::RateLimiter;
use crate::pricing::PricingEngine;
use crate::ws::SubscriptionHub;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub clock: Clock,
    pub config: Arc<ConfigProvider>,
    pub hub: Arc<SubscriptionHub>,
    pub pricing: Arc<PricingEngine>,
    pub margin: Arc<MarginService>,
    pub engine: Arc<MatchingEngine>,
    pub biome: Arc<BiomeMarketEngine>,
    pub instruments: Arc<InstrumentStore>,
    pub ledger: Ledger,
    pub auth: AuthState,
    pub limiter: Arc<RateLimiter>,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
