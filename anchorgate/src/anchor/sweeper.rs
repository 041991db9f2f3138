//! Periodic retry sweep for unanchored audit records.
//!
//! Records whose batch submission failed, or that were parked by budget
//! exhaustion across a restart, stay in the store with null anchoring
//! fields. The sweeper periodically re-enqueues any such record older than
//! a settling age; the batcher deduplicates ids that are already pending,
//! so a sweep can never double-anchor a record.

use super::batcher::BatcherHandle;
use crate::store::GatewayStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct SweeperConfig {
    pub interval: Duration,
    /// Only records older than this are swept, leaving freshly enqueued
    /// records to the normal batching path.
    pub min_age: Duration,
    pub batch_limit: i64,
}

pub fn spawn(
    store: Arc<dyn GatewayStore>,
    batcher: BatcherHandle,
    config: SweeperConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_once(store.as_ref(), &batcher, &config).await;
        }
    })
}

async fn sweep_once(store: &dyn GatewayStore, batcher: &BatcherHandle, config: &SweeperConfig) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(config.min_age).unwrap_or_else(|_| chrono::Duration::zero());
    let stale = match store.list_unanchored(cutoff, config.batch_limit).await {
        Ok(logs) => logs,
        Err(e) => {
            warn!(error = %e, "Unanchored-record sweep query failed");
            return;
        }
    };
    if stale.is_empty() {
        return;
    }
    debug!(count = stale.len(), "Re-enqueueing unanchored records");
    for log in &stale {
        // Outcomes are observed by the batcher's own logging; the sweep
        // does not wait for them.
        let _ = batcher.enqueue(super::PendingRecord::from_log(log)).await;
    }
}
