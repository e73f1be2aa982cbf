//! Runtime configuration.
//!
//! Every tunable lives in one immutable `ConfigSnapshot`. The snapshot is
//! published atomically through `arc-swap`; readers grab a full snapshot on
//! entry to each operation and never observe a torn update. Values come from
//! an optional `config.toml` layer overridden by environment variables.

use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::{env, fs, path::Path, sync::Arc};
use tracing::{info, warn};

/// One rate-limit bucket: burst capacity plus steady refill rate.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    // Server
    pub bind_addr: String,

    // Auth
    pub jwt_secret: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,
    pub password_min_length: usize,
    pub password_require_classes: bool,
    pub max_login_attempts: u32,
    pub lockout_duration_minutes: i64,

    // Rate limits, keyed by bucket name. "default" must exist.
    pub rate_limits: HashMap<String, BucketConfig>,

    // Wallet
    pub min_topup_bdt: i64,
    pub max_topup_bdt: i64,

    // Matching engine fees, basis points. Negative maker = rebate.
    pub maker_fee_bp: f64,
    pub taker_fee_bp: f64,
    pub max_order_notional_bdt: i64,

    // Risk / margin
    pub max_position_pct: f64,
    pub max_instrument_exposure_pct: f64,
    pub margin_call_level: f64,
    pub liquidation_level: f64,
    pub margin_monitor_interval_ms: u64,

    // Pricing
    pub stale_quote_timeout_ms: i64,
    pub cfd_markup_bp: f64,

    // Biome market
    pub biome_trade_fee_percent: f64,
    pub max_transaction_percent: f64,
    pub redistribution_pool_percent: f64,
    pub max_price_move_percent: f64,
    pub redistribution_interval_ms: u64,
    pub biome_trading_paused: bool,
    pub biome_prices_frozen: bool,
    pub biome_initial_cash_bdt: i64,
    pub biome_initial_shares: i64,

    // Marketplace auctions
    pub anti_sniping_window_secs: i64,

    // Payment gateway collaborator
    pub payment_gateway_name: String,
    pub payment_gateway_url: String,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert("default".into(), BucketConfig { capacity: 100.0, refill_per_sec: 10.0 });
        rate_limits.insert("auth".into(), BucketConfig { capacity: 10.0, refill_per_sec: 0.2 });
        rate_limits.insert("orders".into(), BucketConfig { capacity: 30.0, refill_per_sec: 5.0 });
        rate_limits.insert("biome_trade".into(), BucketConfig { capacity: 20.0, refill_per_sec: 2.0 });
        rate_limits.insert("market_data".into(), BucketConfig { capacity: 120.0, refill_per_sec: 20.0 });

        Self {
            bind_addr: "0.0.0.0:8000".into(),
            jwt_secret: "dev-secret-change-in-production-minimum-32-characters".into(),
            access_token_expire_minutes: 60,
            refresh_token_expire_days: 7,
            password_min_length: 12,
            password_require_classes: true,
            max_login_attempts: 5,
            lockout_duration_minutes: 15,
            rate_limits,
            min_topup_bdt: 100,
            max_topup_bdt: 1_000_000,
            maker_fee_bp: 0.0,
            taker_fee_bp: 10.0,
            max_order_notional_bdt: 100_000_000,
            max_position_pct: 0.20,
            max_instrument_exposure_pct: 0.50,
            margin_call_level: 100.0,
            liquidation_level: 50.0,
            margin_monitor_interval_ms: 1_000,
            stale_quote_timeout_ms: 5_000,
            cfd_markup_bp: 0.0,
            biome_trade_fee_percent: 2.0,
            max_transaction_percent: 5.0,
            redistribution_pool_percent: 10.0,
            max_price_move_percent: 5.0,
            redistribution_interval_ms: 500,
            biome_trading_paused: false,
            biome_prices_frozen: false,
            biome_initial_cash_bdt: 1_000_000,
            biome_initial_shares: 10_000,
            anti_sniping_window_secs: 120,
            payment_gateway_name: "rocket".into(),
            payment_gateway_url: String::new(),
        }
    }
}

/// Subset of tunables accepted from `config.toml`. Env vars win over file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<String>,
    jwt_secret: Option<String>,
    biome_trade_fee_percent: Option<f64>,
    redistribution_pool_percent: Option<f64>,
    max_price_move_percent: Option<f64>,
    redistribution_interval_ms: Option<u64>,
    payment_gateway_url: Option<String>,
    rate_limits: Option<HashMap<String, BucketConfig>>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl ConfigSnapshot {
    /// Build a snapshot from `config.toml` (if present) and the environment.
    pub fn load(config_path: Option<&str>) -> Self {
        let mut cfg = Self::default();

        let path = config_path.unwrap_or("config.toml");
        if Path::new(path).exists() {
            match fs::read_to_string(path).map_err(anyhow::Error::from).and_then(|raw| {
                toml::from_str::<FileConfig>(&raw).map_err(anyhow::Error::from)
            }) {
                Ok(file) => {
                    info!("📄 Loaded config file: {}", path);
                    if let Some(v) = file.bind_addr {
                        cfg.bind_addr = v;
                    }
                    if let Some(v) = file.jwt_secret {
                        cfg.jwt_secret = v;
                    }
                    if let Some(v) = file.biome_trade_fee_percent {
                        cfg.biome_trade_fee_percent = v;
                    }
                    if let Some(v) = file.redistribution_pool_percent {
                        cfg.redistribution_pool_percent = v;
                    }
                    if let Some(v) = file.max_price_move_percent {
                        cfg.max_price_move_percent = v;
                    }
                    if let Some(v) = file.redistribution_interval_ms {
                        cfg.redistribution_interval_ms = v;
                    }
                    if let Some(v) = file.payment_gateway_url {
                        cfg.payment_gateway_url = v;
                    }
                    if let Some(buckets) = file.rate_limits {
                        cfg.rate_limits.extend(buckets);
                    }
                }
                Err(e) => warn!("Failed to parse {}: {e:#}", path),
            }
        }

        cfg.bind_addr = env::var("BIND_ADDR").unwrap_or(cfg.bind_addr);
        cfg.jwt_secret = env::var("JWT_SECRET").unwrap_or(cfg.jwt_secret);
        cfg.access_token_expire_minutes =
            env_parse("JWT_ACCESS_TOKEN_EXPIRE_MINUTES", cfg.access_token_expire_minutes);
        cfg.refresh_token_expire_days =
            env_parse("JWT_REFRESH_TOKEN_EXPIRE_DAYS", cfg.refresh_token_expire_days);
        cfg.password_min_length = env_parse("PASSWORD_MIN_LENGTH", cfg.password_min_length);
        cfg.password_require_classes =
            env_flag("PASSWORD_REQUIRE_CLASSES", cfg.password_require_classes);
        cfg.max_login_attempts = env_parse("MAX_LOGIN_ATTEMPTS", cfg.max_login_attempts);
        cfg.lockout_duration_minutes =
            env_parse("LOCKOUT_DURATION_MINUTES", cfg.lockout_duration_minutes);
        cfg.min_topup_bdt = env_parse("MIN_TOPUP_BDT", cfg.min_topup_bdt);
        cfg.max_topup_bdt = env_parse("MAX_TOPUP_BDT", cfg.max_topup_bdt);
        cfg.maker_fee_bp = env_parse("MAKER_FEE_BP", cfg.maker_fee_bp);
        cfg.taker_fee_bp = env_parse("TAKER_FEE_BP", cfg.taker_fee_bp);
        cfg.max_order_notional_bdt = env_parse("MAX_ORDER_NOTIONAL_BDT", cfg.max_order_notional_bdt);
        cfg.max_position_pct = env_parse("MAX_POSITION_PCT", cfg.max_position_pct);
        cfg.max_instrument_exposure_pct =
            env_parse("MAX_INSTRUMENT_EXPOSURE_PCT", cfg.max_instrument_exposure_pct);
        cfg.margin_call_level = env_parse("MARGIN_CALL_LEVEL", cfg.margin_call_level);
        cfg.liquidation_level = env_parse("LIQUIDATION_LEVEL", cfg.liquidation_level);
        cfg.margin_monitor_interval_ms =
            env_parse("MARGIN_MONITOR_INTERVAL_MS", cfg.margin_monitor_interval_ms);
        cfg.stale_quote_timeout_ms = env_parse("STALE_QUOTE_TIMEOUT_MS", cfg.stale_quote_timeout_ms);
        cfg.cfd_markup_bp = env_parse("CFD_MARKUP_BP", cfg.cfd_markup_bp);
        cfg.biome_trade_fee_percent =
            env_parse("BIOME_TRADE_FEE_PERCENT", cfg.biome_trade_fee_percent);
        cfg.max_transaction_percent =
            env_parse("MAX_TRANSACTION_PERCENT", cfg.max_transaction_percent);
        cfg.redistribution_pool_percent =
            env_parse("REDISTRIBUTION_POOL_PERCENT", cfg.redistribution_pool_percent);
        cfg.max_price_move_percent =
            env_parse("MAX_PRICE_MOVE_PERCENT", cfg.max_price_move_percent);
        cfg.redistribution_interval_ms =
            env_parse("REDISTRIBUTION_INTERVAL_MS", cfg.redistribution_interval_ms);
        cfg.biome_trading_paused = env_flag("BIOME_TRADING_PAUSED", cfg.biome_trading_paused);
        cfg.biome_prices_frozen = env_flag("BIOME_PRICES_FROZEN", cfg.biome_prices_frozen);
        cfg.biome_initial_cash_bdt =
            env_parse("BIOME_INITIAL_CASH_BDT", cfg.biome_initial_cash_bdt);
        cfg.biome_initial_shares = env_parse("BIOME_INITIAL_SHARES", cfg.biome_initial_shares);
        cfg.anti_sniping_window_secs =
            env_parse("ANTI_SNIPING_WINDOW_SECS", cfg.anti_sniping_window_secs);
        cfg.payment_gateway_name =
            env::var("PAYMENT_GATEWAY_NAME").unwrap_or(cfg.payment_gateway_name);
        cfg.payment_gateway_url =
            env::var("PAYMENT_GATEWAY_URL").unwrap_or(cfg.payment_gateway_url);

        cfg
    }

    /// Bucket lookup with fallback to the `default` bucket.
    pub fn bucket(&self, name: &str) -> BucketConfig {
        self.rate_limits
            .get(name)
            .or_else(|| self.rate_limits.get("default"))
            .cloned()
            .unwrap_or(BucketConfig { capacity: 100.0, refill_per_sec: 10.0 })
    }
}

/// Shared handle publishing immutable config snapshots.
///
/// Read-shared, write-exclusive via copy-on-write: `store` swaps in a whole
/// new snapshot; in-flight readers keep the one they loaded.
pub struct ConfigProvider {
    inner: ArcSwap<ConfigSnapshot>,
}

impl ConfigProvider {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self { inner: ArcSwap::from_pointee(snapshot) }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    pub fn store(&self, snapshot: ConfigSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = ConfigSnapshot::default();
        assert!(cfg.biome_trade_fee_percent > 0.0);
        assert!(cfg.redistribution_pool_percent > 0.0);
        assert!(cfg.max_price_move_percent > 0.0);
        assert_eq!(cfg.redistribution_interval_ms, 500);
        assert!(cfg.rate_limits.contains_key("default"));
    }

    #[test]
    fn test_bucket_falls_back_to_default() {
        let cfg = ConfigSnapshot::default();
        let bucket = cfg.bucket("nonexistent");
        let default = cfg.bucket("default");
        assert_eq!(bucket.capacity, default.capacity);
    }

    #[test]
    fn test_snapshot_swap_is_atomic_for_readers() {
        let provider = ConfigProvider::new(ConfigSnapshot::default());
        let before = provider.snapshot();

        let mut updated = ConfigSnapshot::default();
        updated.biome_trade_fee_percent = 3.5;
        provider.store(updated);

        // The reader that loaded earlier keeps its coherent snapshot.
        assert_eq!(before.biome_trade_fee_percent, 2.0);
        assert_eq!(provider.snapshot().biome_trade_fee_percent, 3.5);
    }
}
