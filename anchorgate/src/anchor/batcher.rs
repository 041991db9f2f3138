//! In-process batcher aggregating audit records for anchoring.
//!
//! A single consumer loop owns the pending batch. Records arrive over an
//! mpsc channel; each enqueue hands back a oneshot receiver that settles
//! exactly once with the record's [`AnchorOutcome`]. The hot request path
//! never awaits that receiver.
//!
//! A batch flushes when it reaches the current target size, when its oldest
//! record exceeds the flush interval, or on an explicit flush. The target
//! adapts to the daily transaction budget: with `T` transactions budgeted,
//! `t` spent, `r` requests seen and `h` hours elapsed, the remaining day is
//! projected at `r·(24−h)/h` requests and the target is
//! `max(base, ⌈projected/(T−t)⌉)`. Once the budget is spent the target is
//! effectively infinite: records park until the next day and their
//! enqueuers settle immediately with [`AnchorOutcome::BudgetExhausted`].

use super::pipeline::PipelineHandle;
use super::{AnchorOutcome, PendingRecord};
use crate::store::GatewayStore;
use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Batching behaviour knobs, from the `batching` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchingConfig {
    /// Minimum batch size before adaptive scaling kicks in.
    pub base_size: usize,
    /// Maximum age of the oldest pending record before a flush.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Daily cap on anchoring transactions. Zero disables the cap.
    pub daily_tx_budget: u32,
    /// Scale the batch size to the projected request volume.
    pub adaptive: bool,
    /// Periodically re-enqueue stale unanchored records.
    pub sweep_enabled: bool,
    /// How often the retry sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Minimum record age before the sweep will pick it up.
    #[serde(with = "humantime_serde")]
    pub sweep_min_age: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        BatchingConfig {
            base_size: 10,
            flush_interval: Duration::from_secs(60),
            daily_tx_budget: 240,
            adaptive: true,
            sweep_enabled: true,
            sweep_interval: Duration::from_secs(300),
            sweep_min_age: Duration::from_secs(600),
        }
    }
}

enum Command {
    Enqueue(PendingRecord, oneshot::Sender<AnchorOutcome>),
    Flush(oneshot::Sender<()>),
}

/// Producer half of the batcher.
#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl BatcherHandle {
    /// Queue a record for anchoring. The returned receiver settles when the
    /// record's batch anchors, fails, or is parked by budget exhaustion.
    pub async fn enqueue(&self, record: PendingRecord) -> oneshot::Receiver<AnchorOutcome> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(Command::Enqueue(_, reply))) =
            self.tx.send(Command::Enqueue(record, reply)).await
        {
            let _ = reply.send(AnchorOutcome::Failed {
                reason: "batcher is shut down".to_string(),
            });
        }
        rx
    }

    /// Flush whatever is pending and wait for the attempt to conclude.
    pub async fn flush(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Entry {
    record: PendingRecord,
    reply: Option<oneshot::Sender<AnchorOutcome>>,
    enqueued_at: Instant,
}

/// The target batch size for the rest of the day, or `None` once the daily
/// budget is spent.
fn current_target(
    config: &BatchingConfig,
    tx_count: u32,
    request_count: i64,
    hours_elapsed: f64,
) -> Option<usize> {
    let budget = config.daily_tx_budget;
    if budget > 0 && tx_count >= budget {
        return None;
    }
    if !config.adaptive || budget == 0 {
        return Some(config.base_size);
    }
    let hours = hours_elapsed.max(0.05);
    let projected = request_count as f64 * (24.0 - hours) / hours;
    let remaining_tx = (budget - tx_count) as f64;
    let target = (projected / remaining_tx).ceil() as usize;
    Some(target.max(config.base_size))
}

struct Batcher {
    store: Arc<dyn GatewayStore>,
    pipeline: PipelineHandle,
    config: BatchingConfig,
    rx: mpsc::Receiver<Command>,
    pending: Vec<Entry>,
}

/// Spawn the batcher loop. Dropping every [`BatcherHandle`] makes the loop
/// attempt a final flush and exit.
pub fn spawn(
    store: Arc<dyn GatewayStore>,
    pipeline: PipelineHandle,
    config: BatchingConfig,
) -> (BatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let batcher = Batcher {
        store,
        pipeline,
        config,
        rx,
        pending: Vec::new(),
    };
    let task = tokio::spawn(batcher.run());
    (BatcherHandle { tx }, task)
}

impl Batcher {
    async fn run(mut self) {
        loop {
            let deadline = self
                .pending
                .iter()
                .map(|e| e.enqueued_at)
                .min()
                .map(|oldest| oldest + self.config.flush_interval)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Enqueue(record, reply)) => {
                        // The retry sweep may race a record that is still
                        // pending here; never queue the same log twice.
                        if self.pending.iter().any(|e| e.record.log_id == record.log_id) {
                            let _ = reply.send(AnchorOutcome::Failed {
                                reason: "already queued for anchoring".to_string(),
                            });
                            continue;
                        }
                        self.pending.push(Entry {
                            record,
                            reply: Some(reply),
                            enqueued_at: Instant::now(),
                        });
                        if let Some(target) = self.target().await
                            && self.pending.len() >= target
                        {
                            self.flush().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => {
                        // All handles dropped: final flush, then exit.
                        self.flush().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if !self.pending.is_empty() => {
                    debug!(pending = self.pending.len(), "Flushing on oldest-record age");
                    self.flush().await;
                }
            }
        }
    }

    async fn target(&self) -> Option<usize> {
        let today = Utc::now().date_naive();
        let budget = match self.store.get_budget(today).await {
            Ok(b) => b,
            Err(e) => {
                // Sizing is advisory; fall back to the base size.
                warn!(error = %e, "Could not read daily budget; using base batch size");
                return Some(self.config.base_size);
            }
        };
        let now = Utc::now();
        let hours_elapsed = now.num_seconds_from_midnight() as f64 / 3600.0;
        current_target(&self.config, budget.tx_count as u32, budget.request_count, hours_elapsed)
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        if self.target().await.is_none() {
            // Budget spent: settle the futures now so callers never block on
            // anchoring, park the records for the next day, and push their
            // age timestamps forward so the age timer does not spin.
            let parked = self.pending.len();
            let now = Instant::now();
            for entry in &mut self.pending {
                if let Some(reply) = entry.reply.take() {
                    let _ = reply.send(AnchorOutcome::BudgetExhausted);
                }
                entry.enqueued_at = now;
            }
            debug!(parked, "Daily anchoring budget spent; records parked until the next day");
            return;
        }

        let entries: Vec<Entry> = self.pending.drain(..).collect();
        let records: Vec<PendingRecord> = entries.iter().map(|e| e.record.clone()).collect();
        let count = records.len();

        match self.pipeline.submit(records).await {
            Ok(anchored) => {
                debug!(batch_id = anchored.batch_id, count, "Batch anchored");
                for entry in entries {
                    if let Some(reply) = entry.reply {
                        let _ = reply.send(AnchorOutcome::Anchored {
                            batch_id: anchored.batch_id,
                            anchor_tx: anchored.anchor_tx.clone(),
                        });
                    }
                }
            }
            Err(e) => {
                // The audit rows stay unanchored; a later sweep may retry.
                warn!(error = %e, count, "Batch submission failed");
                let reason = e.to_string();
                for entry in entries {
                    if let Some(reply) = entry.reply {
                        let _ = reply.send(AnchorOutcome::Failed {
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }
    }
}
