//! Monitoring engine: probe execution, health state machine, scheduler
//! and the benchmark watcher.

pub mod benchmark;
pub mod health;
pub mod probe;
pub mod scheduler;

use crate::delivery::DeliveryQueue;
use crate::store::{StoreError, TargetStore};

/// Operational snapshot combining store and delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub targets_monitored: u64,
    pub queue_sent: u64,
    pub queue_failed: u64,
    pub queue_dropped: u64,
}

pub async fn gather_stats(
    store: &dyn TargetStore,
    queue: &DeliveryQueue,
) -> Result<MonitorStats, StoreError> {
    let targets_monitored = store.count_enabled_targets().await?;
    let queue_stats = queue.stats();
    Ok(MonitorStats {
        targets_monitored,
        queue_sent: queue_stats.sent,
        queue_failed: queue_stats.failed,
        queue_dropped: queue_stats.dropped,
    })
}
