//! In-memory [`GatewayStore`] used by the test suite and local experiments.
//!
//! A single mutex around all state keeps the multi-step operations
//! (`record_usage`, upserts) atomic with respect to each other, matching the
//! transactional guarantees of the Postgres implementation.

use super::{
    BatchRow, BudgetRow, ConsumerQuota, GatewayStore, NewBatch, NewUsageLog, PricingRow,
    ProofAttachment, Result, StoreError, UsageLog, UsageTotals,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct Inner {
    pub(crate) consumers: HashMap<String, ConsumerQuota>,
    pub(crate) usage_logs: HashMap<Uuid, UsageLog>,
    pub(crate) usage_order: Vec<Uuid>,
    pub(crate) pricing: HashMap<(String, String), PricingRow>,
    pub(crate) batches: Vec<BatchRow>,
    pub(crate) budget: HashMap<NaiveDate, BudgetRow>,
    next_batch_id: i64,
}

#[derive(Default)]
pub struct InMemoryStore {
    pub(crate) inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GatewayStore for InMemoryStore {
    async fn get_or_create_consumer(
        &self,
        consumer_id: &str,
        display_name: Option<&str>,
        external_id: Option<&str>,
        default_quota: Decimal,
    ) -> Result<ConsumerQuota> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let consumer = inner
            .consumers
            .entry(consumer_id.to_string())
            .or_insert_with(|| ConsumerQuota {
                consumer_id: consumer_id.to_string(),
                display_name: display_name.map(str::to_string),
                external_id: external_id.map(str::to_string),
                quota: default_quota,
                used: Decimal::ZERO,
                created_at: now,
                updated_at: now,
            });
        Ok(consumer.clone())
    }

    async fn get_consumer(&self, consumer_id: &str) -> Result<Option<ConsumerQuota>> {
        Ok(self.inner.lock().consumers.get(consumer_id).cloned())
    }

    async fn set_consumer_quota(&self, consumer_id: &str, quota: Decimal) -> Result<ConsumerQuota> {
        let mut inner = self.inner.lock();
        let consumer = inner
            .consumers
            .get_mut(consumer_id)
            .ok_or(StoreError::NotFound)?;
        consumer.quota = quota;
        consumer.updated_at = Utc::now();
        Ok(consumer.clone())
    }

    async fn record_usage(&self, log: NewUsageLog) -> Result<UsageLog> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let consumer = inner
            .consumers
            .get_mut(&log.consumer_id)
            .ok_or(StoreError::NotFound)?;
        consumer.used += log.cost;
        consumer.updated_at = now;

        let row = UsageLog {
            id: Uuid::new_v4(),
            consumer_id: log.consumer_id,
            provider: log.provider,
            model: log.model,
            prompt_tokens: log.prompt_tokens,
            completion_tokens: log.completion_tokens,
            cache_creation_input_tokens: log.cache_creation_input_tokens,
            cache_read_input_tokens: log.cache_read_input_tokens,
            cost: log.cost,
            status: log.status,
            estimated: log.estimated,
            request_body: log.request_body,
            response_body: log.response_body,
            request_hash: log.request_hash,
            response_hash: log.response_hash,
            batch_id: None,
            leaf_hash: None,
            merkle_proof: None,
            anchor_tx: None,
            created_at: now,
        };
        inner.usage_logs.insert(row.id, row.clone());
        inner.usage_order.push(row.id);
        Ok(row)
    }

    async fn get_usage_log(&self, id: Uuid) -> Result<Option<UsageLog>> {
        Ok(self.inner.lock().usage_logs.get(&id).cloned())
    }

    async fn list_usage_logs(
        &self,
        consumer_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UsageLog>> {
        let inner = self.inner.lock();
        let logs: Vec<UsageLog> = inner
            .usage_order
            .iter()
            .rev()
            .filter_map(|id| inner.usage_logs.get(id))
            .filter(|log| consumer_id.is_none_or(|c| log.consumer_id == c))
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(logs)
    }

    async fn usage_totals(&self) -> Result<Vec<UsageTotals>> {
        let inner = self.inner.lock();
        let mut by_consumer: HashMap<&str, UsageTotals> = HashMap::new();
        for log in inner.usage_logs.values() {
            let entry = by_consumer
                .entry(log.consumer_id.as_str())
                .or_insert_with(|| UsageTotals {
                    consumer_id: log.consumer_id.clone(),
                    calls: 0,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    cost: Decimal::ZERO,
                });
            entry.calls += 1;
            entry.prompt_tokens += log.prompt_tokens;
            entry.completion_tokens += log.completion_tokens;
            entry.cost += log.cost;
        }
        let mut totals: Vec<UsageTotals> = by_consumer.into_values().collect();
        totals.sort_by(|a, b| a.consumer_id.cmp(&b.consumer_id));
        Ok(totals)
    }

    async fn list_unanchored(
        &self,
        older_than: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UsageLog>> {
        let inner = self.inner.lock();
        Ok(inner
            .usage_order
            .iter()
            .filter_map(|id| inner.usage_logs.get(id))
            .filter(|log| log.batch_id.is_none() && log.created_at < older_than)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_pricing(&self) -> Result<Vec<PricingRow>> {
        let mut rows: Vec<PricingRow> = self.inner.lock().pricing.values().cloned().collect();
        rows.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        Ok(rows)
    }

    async fn upsert_pricing(&self, row: &PricingRow) -> Result<()> {
        self.inner
            .lock()
            .pricing
            .insert((row.provider.clone(), row.model.clone()), row.clone());
        Ok(())
    }

    async fn delete_pricing(&self, provider: &str, model: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .pricing
            .remove(&(provider.to_string(), model.to_string()))
            .is_some())
    }

    async fn insert_batch(&self, batch: &NewBatch) -> Result<BatchRow> {
        let mut inner = self.inner.lock();
        inner.next_batch_id += 1;
        let row = BatchRow {
            id: inner.next_batch_id,
            merkle_root: batch.merkle_root.clone(),
            chain_hash: batch.chain_hash.clone(),
            tx_seq: batch.tx_seq,
            prev_tx_seq: batch.prev_tx_seq,
            anchor_tx: batch.anchor_tx.clone(),
            block_height: batch.block_height,
            log_count: batch.log_count,
            created_at: Utc::now(),
        };
        inner.batches.push(row.clone());
        Ok(row)
    }

    async fn get_batch(&self, id: i64) -> Result<Option<BatchRow>> {
        Ok(self.inner.lock().batches.iter().find(|b| b.id == id).cloned())
    }

    async fn list_batches(&self, limit: i64) -> Result<Vec<BatchRow>> {
        let inner = self.inner.lock();
        Ok(inner
            .batches
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn max_anchor_sequence(&self) -> Result<Option<i64>> {
        Ok(self.inner.lock().batches.iter().map(|b| b.tx_seq).max())
    }

    async fn attach_proofs(&self, attachments: &[ProofAttachment]) -> Result<()> {
        let mut inner = self.inner.lock();
        for attachment in attachments {
            let Some(log) = inner.usage_logs.get_mut(&attachment.log_id) else {
                continue;
            };
            // Anchored records are immutable.
            if log.batch_id.is_some() {
                continue;
            }
            log.batch_id = Some(attachment.batch_id);
            log.leaf_hash = Some(attachment.leaf_hash.clone());
            log.merkle_proof = Some(attachment.merkle_proof.clone());
            log.anchor_tx = Some(attachment.anchor_tx.clone());
        }
        Ok(())
    }

    async fn bump_request_count(&self, period: NaiveDate) -> Result<()> {
        let mut inner = self.inner.lock();
        let row = inner
            .budget
            .entry(period)
            .or_insert_with(|| BudgetRow::empty(period));
        row.request_count += 1;
        row.last_updated = Utc::now();
        Ok(())
    }

    async fn bump_anchor_tx_count(&self, period: NaiveDate) -> Result<()> {
        let mut inner = self.inner.lock();
        let row = inner
            .budget
            .entry(period)
            .or_insert_with(|| BudgetRow::empty(period));
        row.tx_count += 1;
        row.last_updated = Utc::now();
        Ok(())
    }

    async fn get_budget(&self, period: NaiveDate) -> Result<BudgetRow> {
        Ok(self
            .inner
            .lock()
            .budget
            .get(&period)
            .cloned()
            .unwrap_or_else(|| BudgetRow::empty(period)))
    }
}
