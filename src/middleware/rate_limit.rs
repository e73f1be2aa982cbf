//! Rate limiting middleware.
//!
//! Token buckets keyed by (bucket, identifier) with lazy refill. Buckets are
//! sharded by bucket name so `orders` traffic never contends on the `auth`
//! shard lock. The `check` call is increment-and-test atomic under the shard
//! lock. Idle entries are evicted by a background task.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::auth::models::Claims;
use crate::config::ConfigProvider;
use crate::error::MarketError;

/// Entries untouched this long are garbage-collected.
const IDLE_EVICTION: Duration = Duration::from_secs(3600);

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

type Shard = Arc<Mutex<HashMap<String, TokenBucket>>>;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds when the bucket is full again.
    pub reset_epoch: i64,
    /// Wait until the next token becomes available (deny only).
    pub retry_after: Duration,
}

pub struct RateLimiter {
    config: Arc<ConfigProvider>,
    shards: RwLock<HashMap<String, Shard>>,
}

impl RateLimiter {
    pub fn new(config: Arc<ConfigProvider>) -> Self {
        Self { config, shards: RwLock::new(HashMap::new()) }
    }

    fn shard(&self, bucket: &str) -> Shard {
        if let Some(shard) = self.shards.read().get(bucket) {
            return shard.clone();
        }
        let mut shards = self.shards.write();
        shards
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    /// Refill-then-test for `cost` tokens. Consumed tokens are not refunded
    /// on caller cancellation.
    pub fn check(&self, bucket: &str, identifier: &str, cost: f64) -> RateLimitDecision {
        let cfg = self.config.snapshot().bucket(bucket);
        let capacity = cfg.capacity.max(1.0);
        let rate = cfg.refill_per_sec.max(f64::MIN_POSITIVE);

        let shard = self.shard(bucket);
        let mut entries = shard.lock();
        let now = Instant::now();

        let entry = entries.entry(identifier.to_string()).or_insert(TokenBucket {
            tokens: capacity,
            last_refill: now,
            last_touched: now,
        });

        let elapsed = now.duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * rate).min(capacity);
        entry.last_refill = now;
        entry.last_touched = now;

        let allowed = entry.tokens >= cost;
        if allowed {
            entry.tokens -= cost;
        }

        let deficit = (cost - entry.tokens).max(0.0);
        let retry_after = Duration::from_secs_f64(deficit / rate);
        let secs_to_full = (capacity - entry.tokens).max(0.0) / rate;
        let reset_epoch = chrono::Utc::now().timestamp() + secs_to_full.ceil() as i64;

        RateLimitDecision {
            allowed,
            limit: capacity as u64,
            remaining: entry.tokens.floor() as u64,
            reset_epoch,
            retry_after,
        }
    }

    /// Drop entries idle for longer than an hour. Call from a background task.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        let shards: Vec<Shard> = self.shards.read().values().cloned().collect();
        let mut evicted = 0usize;
        for shard in shards {
            let mut entries = shard.lock();
            let before = entries.len();
            entries.retain(|_, b| now.duration_since(b.last_touched) < IDLE_EVICTION);
            evicted += before - entries.len();
        }
        if evicted > 0 {
            debug!(evicted, "Rate limiter evicted idle buckets");
        }
    }
}

/// Per-route-group state: which bucket the group draws from.
#[derive(Clone)]
pub struct RateLimitContext {
    pub limiter: Arc<RateLimiter>,
    pub bucket: &'static str,
}

/// Axum middleware applying the token bucket and the `X-RateLimit-*` headers.
///
/// The identifier is the authenticated user when claims are present (the
/// auth layer runs before this one on protected routes), else the client IP.
pub async fn rate_limit_middleware(
    State(ctx): State<RateLimitContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let identifier = request
        .extensions()
        .get::<Claims>()
        .map(|c| c.sub.clone())
        .unwrap_or_else(|| addr.ip().to_string());

    let decision = ctx.limiter.check(ctx.bucket, &identifier, 1.0);

    if !decision.allowed {
        warn!(
            bucket = ctx.bucket,
            identifier = %identifier,
            retry_after_secs = decision.retry_after.as_secs(),
            "Rate limit exceeded"
        );
        return MarketError::RateLimited {
            limit: decision.limit,
            retry_after_secs: decision.retry_after.as_secs().max(1),
            reset_epoch: decision.reset_epoch,
        }
        .into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_epoch.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketConfig, ConfigSnapshot};

    fn limiter_with(capacity: f64, refill_per_sec: f64) -> RateLimiter {
        let mut cfg = ConfigSnapshot::default();
        cfg.rate_limits.insert("test".into(), BucketConfig { capacity, refill_per_sec });
        RateLimiter::new(Arc::new(ConfigProvider::new(cfg)))
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let limiter = limiter_with(5.0, 1.0);
        for _ in 0..5 {
            assert!(limiter.check("test", "u1", 1.0).allowed);
        }
        let denied = limiter.check("test", "u1", 1.0);
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = limiter_with(1.0, 0.001);
        assert!(limiter.check("test", "u1", 1.0).allowed);
        assert!(!limiter.check("test", "u1", 1.0).allowed);
        assert!(limiter.check("test", "u2", 1.0).allowed);
    }

    #[test]
    fn test_lazy_refill_grants_again() {
        let limiter = limiter_with(1.0, 1000.0);
        assert!(limiter.check("test", "u1", 1.0).allowed);
        std::thread::sleep(Duration::from_millis(5));
        // 5ms at 1000 tokens/s is enough for a full token.
        assert!(limiter.check("test", "u1", 1.0).allowed);
    }

    #[test]
    fn test_window_grant_bound() {
        // Over a window W the grants cannot exceed burst + ceil(W * rate).
        let limiter = limiter_with(3.0, 100.0);
        let start = Instant::now();
        let mut granted = 0u32;
        while start.elapsed() < Duration::from_millis(50) {
            if limiter.check("test", "u1", 1.0).allowed {
                granted += 1;
            }
        }
        let window_secs = start.elapsed().as_secs_f64();
        let bound = 3.0 + (window_secs * 100.0).ceil();
        assert!(
            (granted as f64) <= bound,
            "granted {granted} exceeds bound {bound}"
        );
    }

    #[test]
    fn test_unknown_bucket_uses_default() {
        let limiter = limiter_with(5.0, 1.0);
        let decision = limiter.check("never-configured", "u1", 1.0);
        assert!(decision.allowed);
        assert_eq!(decision.limit, 100); // default bucket capacity
    }

    #[test]
    fn test_evict_idle_keeps_fresh_entries() {
        let limiter = limiter_with(5.0, 1.0);
        limiter.check("test", "u1", 1.0);
        limiter.evict_idle();
        let decision = limiter.check("test", "u1", 1.0);
        assert!(decision.remaining < 5, "fresh entry must survive eviction");
    }
}
