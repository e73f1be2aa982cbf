//! TerraMarket backend entry point.
//!
//! Wires the stores and engines together, starts the background workers
//! (biome redistribution, margin monitor, DAY-order sweep, rate-limit GC)
//! and serves the HTTP/WS surface. Shutdown drains in-flight connections,
//! signals the workers, and waits for their current cycle to finish.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use terramarket_backend::api::{build_router, AppState};
use terramarket_backend::auth::{api::AuthState, JwtHandler, SessionStore, UserStore};
use terramarket_backend::biome::{spawn_biome_worker, BiomeMarketEngine};
use terramarket_backend::clock::{Clock, ShutdownSignal};
use terramarket_backend::config::{ConfigProvider, ConfigSnapshot};
use terramarket_backend::db::Db;
use terramarket_backend::ledger::Ledger;
use terramarket_backend::market::{
    InstrumentStore, MarginService, MatchingEngine, RiskEngine,
};
use terramarket_backend::middleware::RateLimiter;
use terramarket_backend::payment::{DisabledPaymentGateway, HttpPaymentGateway, PaymentGateway};
use terramarket_backend::pricing::PricingEngine;
use terramarket_backend::ws::SubscriptionHub;

#[derive(Debug, Parser)]
#[command(name = "terramarket", about = "Multi-asset trading platform backend")]
struct Cli {
    /// Listen address, overrides BIND_ADDR.
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database path.
    #[arg(long, env = "DB_PATH", default_value = "terramarket.db")]
    db_path: String,

    /// Optional config file (TOML).
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,terramarket_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut snapshot = ConfigSnapshot::load(cli.config.as_deref());
    if let Some(bind) = cli.bind.clone() {
        snapshot.bind_addr = bind;
    }
    let bind_addr = snapshot.bind_addr.clone();
    let jwt_secret = snapshot.jwt_secret.clone();
    let access_minutes = snapshot.access_token_expire_minutes;
    let refresh_days = snapshot.refresh_token_expire_days;
    let config = Arc::new(ConfigProvider::new(snapshot));

    let clock = Clock::new();
    let db = Db::open(&cli.db_path).context("open database")?;
    info!("📊 Database initialized at: {}", cli.db_path);

    // Stores and engines, leaves first.
    let users = Arc::new(UserStore::new(db.clone(), clock.clone()));
    let sessions = Arc::new(SessionStore::new(db.clone()));
    let jwt = Arc::new(JwtHandler::new(jwt_secret, access_minutes, refresh_days));
    let ledger = Ledger::new(db.clone(), clock.clone());
    let instruments = Arc::new(InstrumentStore::new(db.clone(), clock.clone()));
    instruments.load().await.map_err(|e| anyhow::anyhow!("load instruments: {e}"))?;

    let hub = Arc::new(SubscriptionHub::new());
    let pricing = Arc::new(PricingEngine::new(config.clone(), clock.clone()));
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
    engine.load_venue_status().await.map_err(|e| anyhow::anyhow!("load venue status: {e}"))?;
    engine.recover().await.map_err(|e| anyhow::anyhow!("recover order books: {e}"))?;

    let gateway: Arc<dyn PaymentGateway> = {
        let cfg = config.snapshot();
        if cfg.payment_gateway_url.trim().is_empty() {
            warn!("⚠️ Payment gateway NOT configured; underfunded buys will not get a payment URL");
            Arc::new(DisabledPaymentGateway)
        } else {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("build HTTP client")?;
            info!(gateway = %cfg.payment_gateway_name, "💳 Payment gateway configured");
            Arc::new(HttpPaymentGateway::new(
                cfg.payment_gateway_name.clone(),
                cfg.payment_gateway_url.clone(),
                client,
            ))
        }
    };

    let biome = Arc::new(BiomeMarketEngine::new(
        db.clone(),
        clock.clone(),
        config.clone(),
        hub.clone(),
        gateway,
    ));
    biome
        .initialize_markets()
        .await
        .map_err(|e| anyhow::anyhow!("initialize biome markets: {e}"))?;

    let limiter = Arc::new(RateLimiter::new(config.clone()));

    let shutdown = ShutdownSignal::new();

    // Background workers.
    let biome_worker = spawn_biome_worker(biome.clone(), config.clone(), shutdown.subscribe());

    let margin_monitor = {
        let margin = margin.clone();
        let engine = engine.clone();
        let config = config.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            info!("🛡️ Margin monitor started");
            loop {
                let interval = config.snapshot().margin_monitor_interval_ms.max(100);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(interval)) => {
                        let accounts = match margin.users_with_positions().await {
                            Ok(accounts) => accounts,
                            Err(e) => {
                                error!("Margin monitor query failed: {e}");
                                continue;
                            }
                        };
                        for user in accounts {
                            let engine = engine.clone();
                            let result = margin
                                .check_account(user, move |u| async move {
                                    engine.cancel_all_for_user(u).await.map(|_| ())
                                })
                                .await;
                            if let Err(e) = result {
                                error!(user = %user, "Margin check failed: {e}");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("Margin monitor stopped");
        })
    };

    let housekeeping = {
        let limiter = limiter.clone();
        let engine = engine.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        limiter.evict_idle();
                        if let Err(e) = engine.sweep_day_orders().await {
                            warn!("DAY order sweep failed: {e}");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    };

    let auth = AuthState { users, sessions, jwt, config: config.clone() };
    let state = AppState {
        db,
        clock,
        config,
        hub,
        pricing,
        margin,
        engine,
        biome,
        instruments,
        ledger,
        auth,
        limiter,
    };

    let app = build_router(state);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    info!("🚀 TerraMarket listening on {bind_addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received, draining connections");
        })
        .await
        .context("serve")?;

    // HTTP drained; stop the workers and wait for their current cycle.
    shutdown.shutdown();
    let _ = biome_worker.await;
    let _ = margin_monitor.await;
    let _ = housekeeping.await;
    info!("👋 Shutdown complete");

    Ok(())
}
