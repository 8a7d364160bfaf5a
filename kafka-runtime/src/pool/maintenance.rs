//! Background loops: trim + optimize for the producer pool, and a
//! rebalance-monitor pass over the consumer pool. Grounded on the janitor's
//! `cleanup_loop` (`tokio::time::interval` + a loop body that logs and
//! swallows its own errors rather than taking the process down).

use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use tracing::{debug, warn};

use crate::config::PoolConfig;

use super::client_pool::ProducerPool;

/// Runs until the process exits: trims idle/unhealthy clients, then shrinks
/// underutilized buckets, on a fixed interval. A panic-free loop body means
/// a single bad tick never takes the timer down; we just log and keep
/// ticking.
pub async fn maintenance_loop(pool: Arc<ProducerPool>, config: PoolConfig, liveness: HealthHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.maintenance_interval_secs));
    loop {
        interval.tick().await;
        pool.trim();
        pool.optimize(config.min_pool_size, config.low_utilization_threshold);
        pool.publish_metrics();
        debug!("pool maintenance tick complete");
        liveness.report_healthy().await;
    }
}

/// Observes per-group usage-count spread within the consumer pool and logs a
/// suggestion when it looks imbalanced. Cluster administration (actually
/// rebalancing) is out of scope; this loop is metrics/log-only.
pub async fn rebalance_monitor_loop(
    pool: Arc<super::client_pool::ConsumerPool>,
    interval_secs: u64,
    overload_threshold: f64,
    liveness: HealthHandle,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        let health = pool.health(overload_threshold);
        for issue in &health.issues {
            warn!(key = %issue.key_description, detail = %issue.detail, "consumer pool load imbalance");
        }
        pool.publish_metrics();
        debug!(keys = pool.key_count(), "rebalance-monitor tick complete");
        liveness.report_healthy().await;
    }
}
