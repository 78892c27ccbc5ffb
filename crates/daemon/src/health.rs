//! Pool health monitor
//!
//! Periodically probes sandboxes and quarantines those behind stale
//! allocations. Quarantined sandboxes are then evicted, and the configured
//! number of sandboxes is kept warm.

use crate::pool::PoolManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Background maintenance loop for a [`PoolManager`]
pub struct HealthMonitor {
    pool: Arc<PoolManager>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self { pool }
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = self.pool.config().health_interval();
        info!("Health monitor started (interval {:?})", interval);

        loop {
            self.tick().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Health monitor stopped");
    }

    /// One maintenance pass
    pub async fn tick(&self) {
        let summary = self.pool.health_check().await;
        debug!(
            "Health check: {} probed, {} healthy, {} degraded, {} unresponsive",
            summary.probed, summary.healthy, summary.degraded, summary.unresponsive
        );

        let timeout = self.pool.config().stale_allocation_timeout();
        let stale = self.pool.sweep_stale(timeout).await;
        if !stale.is_empty() {
            warn!("Quarantined {} stale allocation(s)", stale.len());
        }

        let evicted = self.pool.evict_unresponsive().await;
        if evicted > 0 {
            warn!("Evicted {} unresponsive sandbox(es)", evicted);
        }

        let min_idle = self.pool.config().min_idle;
        if min_idle > 0 {
            if let Err(e) = self.pool.warm_up(min_idle).await {
                error!("Warm-up failed: {}", e);
            }
        }
    }
}
