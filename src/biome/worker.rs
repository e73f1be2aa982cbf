//! Biome market background worker.
//!
//! A single dedicated task drives the redistribution cycle: block on the
//! interval timer, run one cycle end-to-end, check for shutdown. The
//! interval is re-read from config each lap so the period can be retuned
//! without a restart.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::biome::market::BiomeMarketEngine;
use crate::clock::ShutdownReceiver;
use crate::config::ConfigProvider;

pub fn spawn_biome_worker(
    engine: Arc<BiomeMarketEngine>,
    config: Arc<ConfigProvider>,
    mut shutdown: ShutdownReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = config.snapshot().redistribution_interval_ms;
        info!(interval_ms = period, "🔄 Biome market worker started");

        loop {
            let period = config.snapshot().redistribution_interval_ms.max(10);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(period)) => {
                    match engine.redistribute().await {
                        Ok(result) if result.redistributed => {
                            info!(
                                tmc = result.total_market_cash,
                                pool = result.pool,
                                attention = result.total_attention,
                                "Redistribution cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Redistribution cycle failed: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }

        info!("Biome market worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ShutdownSignal};
    use crate::config::ConfigSnapshot;
    use crate::db::Db;
    use crate::payment::DisabledPaymentGateway;
    use crate::ws::hub::SubscriptionHub;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_worker_runs_cycles_and_stops() {
        let db = Db::open_in_memory().unwrap();
        let mut cfg = ConfigSnapshot::default();
        cfg.redistribution_interval_ms = 20;
        let config = Arc::new(ConfigProvider::new(cfg));
        let engine = Arc::new(BiomeMarketEngine::new(
            db.clone(),
            Clock::new(),
            config.clone(),
            Arc::new(SubscriptionHub::new()),
            Arc::new(DisabledPaymentGateway),
        ));
        engine.initialize_markets().await.unwrap();

        // Seed attention so a cycle actually redistributes.
        let user = Uuid::new_v4();
        engine.track_attention(user, crate::biome::Biome::Ocean, 1.0).await.unwrap();

        let signal = ShutdownSignal::new();
        let handle = spawn_biome_worker(engine.clone(), config, signal.subscribe());

        tokio::time::sleep(Duration::from_millis(120)).await;
        signal.shutdown();
        handle.await.unwrap();

        // At least one cycle ran: attention was consumed.
        let ocean = engine.market(crate::biome::Biome::Ocean).await.unwrap();
        assert_eq!(ocean.attention, 0.0);
        assert!(ocean.last_redistribution_at.is_some());
    }
}
