//! HTTP surface: router assembly.
//!
//! The auth-context layer runs on every route and resolves the request's
//! identity once; handlers opt into enforcement through the `Authed` /
//! `AdminOnly` extractors. Each route group draws from its own rate-limit
//! bucket, keyed by user when authenticated, else by client IP.

pub mod routes;
pub mod state;

use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::auth::{api as auth_api, auth_context_middleware, middleware::AuthLayerState};
use crate::middleware::{rate_limit_middleware, RateLimitContext};
use crate::ws::websocket_handler;

pub use state::AppState;

pub fn build_router(state: AppState) -> Router {
    let auth_layer_state = AuthLayerState {
        jwt: state.auth.jwt.clone(),
        sessions: state.auth.sessions.clone(),
    };
    let limiter = state.limiter.clone();
    let bucket = |bucket: &'static str| {
        axum_mw::from_fn_with_state(
            RateLimitContext { limiter: limiter.clone(), bucket },
            rate_limit_middleware,
        )
    };

    let auth_routes = Router::new()
        .route("/auth/register", post(auth_api::register))
        .route("/auth/login", post(auth_api::login))
        .route("/auth/refresh", post(auth_api::refresh))
        .route("/auth/me", get(auth_api::me))
        .route("/auth/logout", post(auth_api::logout))
        .route_layer(bucket("auth"));

    let catalog = Router::new()
        .route("/instruments", get(routes::list_instruments).post(routes::create_instrument))
        .route(
            "/instruments/:id",
            axum::routing::patch(routes::patch_instrument).delete(routes::delete_instrument),
        )
        .route("/market/status", get(routes::get_market_status).post(routes::set_market_status))
        .route("/marketdata/lp-quotes", post(routes::ingest_lp_quote))
        .route_layer(bucket("default"));

    let market_data = Router::new()
        .route("/trades", get(routes::list_trades))
        .route("/marketdata/quotes/:instrument_id", get(routes::get_quote))
        .route("/marketdata/depth/:instrument_id", get(routes::get_depth))
        .route("/marketdata/candles/:instrument_id", get(routes::get_candles))
        .route("/biome-market/markets", get(routes::biome_markets))
        .route("/biome-market/markets/:biome", get(routes::biome_market))
        .route_layer(bucket("market_data"));

    let trading = Router::new()
        .route("/orders", post(routes::place_order).get(routes::list_orders))
        .route("/orders/:id", axum::routing::delete(routes::cancel_order))
        .route("/margin/account", get(routes::margin_account))
        .route_layer(bucket("orders"));

    let biome_trading = Router::new()
        .route("/biome-market/buy", post(routes::biome_buy))
        .route("/biome-market/sell", post(routes::biome_sell))
        .route("/biome-market/portfolio", get(routes::biome_portfolio))
        .route("/biome-market/transactions", get(routes::biome_transactions))
        .route("/biome-market/track-attention", post(routes::track_attention))
        .route("/wallet/topup", post(routes::topup))
        .route_layer(bucket("biome_trade"));

    Router::new()
        .route("/health", get(routes::health_check))
        .route("/ws/marketdata", get(websocket_handler))
        .merge(auth_routes)
        .merge(catalog)
        .merge(market_data)
        .merge(trading)
        .merge(biome_trading)
        .layer(
            ServiceBuilder::new()
                .layer(axum_mw::from_fn(crate::middleware::request_logging))
                .layer(CorsLayer::permissive())
                .layer(axum_mw::from_fn_with_state(auth_layer_state, auth_context_middleware)),
        )
        .with_state(state)
}
