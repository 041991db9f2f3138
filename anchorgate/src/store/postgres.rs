//! PostgreSQL-backed [`GatewayStore`].
//!
//! Queries use the runtime sqlx API so the crate builds without a live
//! database. The quota debit and audit insert run in one transaction; the
//! budget counters are single-statement `ON CONFLICT` upserts.

use super::{
    BatchRow, BudgetRow, ConsumerQuota, GatewayStore, NewBatch, NewUsageLog, PricingRow,
    ProofAttachment, Result, StoreError, UsageLog, UsageTotals,
};
use crate::merkle::MerkleProof;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, types::Json};
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ConsumerRow {
    consumer_id: String,
    display_name: Option<String>,
    external_id: Option<String>,
    quota: Decimal,
    used: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConsumerRow> for ConsumerQuota {
    fn from(row: ConsumerRow) -> Self {
        ConsumerQuota {
            consumer_id: row.consumer_id,
            display_name: row.display_name,
            external_id: row.external_id,
            quota: row.quota,
            used: row.used,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct UsageLogRow {
    id: Uuid,
    consumer_id: String,
    provider: String,
    model: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    cache_creation_input_tokens: i64,
    cache_read_input_tokens: i64,
    cost: Decimal,
    status: i32,
    estimated: bool,
    request_body: Option<String>,
    response_body: Option<String>,
    request_hash: String,
    response_hash: String,
    batch_id: Option<i64>,
    leaf_hash: Option<String>,
    merkle_proof: Option<Json<MerkleProof>>,
    anchor_tx: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<UsageLogRow> for UsageLog {
    fn from(row: UsageLogRow) -> Self {
        UsageLog {
            id: row.id,
            consumer_id: row.consumer_id,
            provider: row.provider,
            model: row.model,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            cache_creation_input_tokens: row.cache_creation_input_tokens,
            cache_read_input_tokens: row.cache_read_input_tokens,
            cost: row.cost,
            status: row.status,
            estimated: row.estimated,
            request_body: row.request_body,
            response_body: row.response_body,
            request_hash: row.request_hash,
            response_hash: row.response_hash,
            batch_id: row.batch_id,
            leaf_hash: row.leaf_hash,
            merkle_proof: row.merkle_proof.map(|p| p.0),
            anchor_tx: row.anchor_tx,
            created_at: row.created_at,
        }
    }
}

const USAGE_LOG_COLUMNS: &str = "id, consumer_id, provider, model, prompt_tokens, \
    completion_tokens, cache_creation_input_tokens, cache_read_input_tokens, cost, status, \
    estimated, request_body, response_body, request_hash, response_hash, batch_id, leaf_hash, \
    merkle_proof, anchor_tx, created_at";

#[derive(FromRow)]
struct BatchDbRow {
    id: i64,
    merkle_root: String,
    chain_hash: String,
    tx_seq: i64,
    prev_tx_seq: i64,
    anchor_tx: String,
    block_height: i64,
    log_count: i32,
    created_at: DateTime<Utc>,
}

impl From<BatchDbRow> for BatchRow {
    fn from(row: BatchDbRow) -> Self {
        BatchRow {
            id: row.id,
            merkle_root: row.merkle_root,
            chain_hash: row.chain_hash,
            tx_seq: row.tx_seq,
            prev_tx_seq: row.prev_tx_seq,
            anchor_tx: row.anchor_tx,
            block_height: row.block_height,
            log_count: row.log_count,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl GatewayStore for PostgresStore {
    #[instrument(skip(self), err)]
    async fn get_or_create_consumer(
        &self,
        consumer_id: &str,
        display_name: Option<&str>,
        external_id: Option<&str>,
        default_quota: Decimal,
    ) -> Result<ConsumerQuota> {
        // DO UPDATE on the key alone so the existing row is returned
        // untouched; quota and usage are never reset by a lookup.
        let row = sqlx::query_as::<_, ConsumerRow>(
            r#"
            INSERT INTO consumer_quotas (consumer_id, display_name, external_id, quota)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (consumer_id) DO UPDATE SET consumer_id = EXCLUDED.consumer_id
            RETURNING consumer_id, display_name, external_id, quota, used, created_at, updated_at
            "#,
        )
        .bind(consumer_id)
        .bind(display_name)
        .bind(external_id)
        .bind(default_quota)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    #[instrument(skip(self), err)]
    async fn get_consumer(&self, consumer_id: &str) -> Result<Option<ConsumerQuota>> {
        let row = sqlx::query_as::<_, ConsumerRow>(
            "SELECT consumer_id, display_name, external_id, quota, used, created_at, updated_at \
             FROM consumer_quotas WHERE consumer_id = $1",
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), err)]
    async fn set_consumer_quota(&self, consumer_id: &str, quota: Decimal) -> Result<ConsumerQuota> {
        let row = sqlx::query_as::<_, ConsumerRow>(
            r#"
            UPDATE consumer_quotas
            SET quota = $2, updated_at = NOW()
            WHERE consumer_id = $1
            RETURNING consumer_id, display_name, external_id, quota, used, created_at, updated_at
            "#,
        )
        .bind(consumer_id)
        .bind(quota)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.into())
    }

    #[instrument(skip(self, log), fields(consumer_id = %log.consumer_id, model = %log.model), err)]
    async fn record_usage(&self, log: NewUsageLog) -> Result<UsageLog> {
        let mut tx = self.pool.begin().await?;

        let debited = sqlx::query(
            "UPDATE consumer_quotas SET used = used + $2, updated_at = NOW() WHERE consumer_id = $1",
        )
        .bind(&log.consumer_id)
        .bind(log.cost)
        .execute(&mut *tx)
        .await?;
        if debited.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        let row = sqlx::query_as::<_, UsageLogRow>(&format!(
            r#"
            INSERT INTO usage_logs (
                id, consumer_id, provider, model, prompt_tokens, completion_tokens,
                cache_creation_input_tokens, cache_read_input_tokens, cost, status, estimated,
                request_body, response_body, request_hash, response_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {USAGE_LOG_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&log.consumer_id)
        .bind(&log.provider)
        .bind(&log.model)
        .bind(log.prompt_tokens)
        .bind(log.completion_tokens)
        .bind(log.cache_creation_input_tokens)
        .bind(log.cache_read_input_tokens)
        .bind(log.cost)
        .bind(log.status)
        .bind(log.estimated)
        .bind(&log.request_body)
        .bind(&log.response_body)
        .bind(&log.request_hash)
        .bind(&log.response_hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    #[instrument(skip(self), err)]
    async fn get_usage_log(&self, id: Uuid) -> Result<Option<UsageLog>> {
        let row = sqlx::query_as::<_, UsageLogRow>(&format!(
            "SELECT {USAGE_LOG_COLUMNS} FROM usage_logs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), err)]
    async fn list_usage_logs(
        &self,
        consumer_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UsageLog>> {
        let rows = sqlx::query_as::<_, UsageLogRow>(&format!(
            r#"
            SELECT {USAGE_LOG_COLUMNS} FROM usage_logs
            WHERE ($1::TEXT IS NULL OR consumer_id = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(consumer_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn usage_totals(&self) -> Result<Vec<UsageTotals>> {
        #[derive(FromRow)]
        struct TotalsRow {
            consumer_id: String,
            calls: i64,
            prompt_tokens: i64,
            completion_tokens: i64,
            cost: Decimal,
        }

        let rows = sqlx::query_as::<_, TotalsRow>(
            r#"
            SELECT consumer_id,
                   COUNT(*) AS calls,
                   COALESCE(SUM(prompt_tokens), 0)::BIGINT AS prompt_tokens,
                   COALESCE(SUM(completion_tokens), 0)::BIGINT AS completion_tokens,
                   COALESCE(SUM(cost), 0) AS cost
            FROM usage_logs
            GROUP BY consumer_id
            ORDER BY consumer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UsageTotals {
                consumer_id: r.consumer_id,
                calls: r.calls,
                prompt_tokens: r.prompt_tokens,
                completion_tokens: r.completion_tokens,
                cost: r.cost,
            })
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn list_unanchored(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UsageLog>> {
        let rows = sqlx::query_as::<_, UsageLogRow>(&format!(
            r#"
            SELECT {USAGE_LOG_COLUMNS} FROM usage_logs
            WHERE batch_id IS NULL AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn list_pricing(&self) -> Result<Vec<PricingRow>> {
        let rows = sqlx::query_as::<_, PricingDbRow>(
            "SELECT provider, model, input_rate, output_rate, cache_write_rate, cache_read_rate \
             FROM model_pricing ORDER BY provider, model",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, row), fields(provider = %row.provider, model = %row.model), err)]
    async fn upsert_pricing(&self, row: &PricingRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO model_pricing (provider, model, input_rate, output_rate, cache_write_rate, cache_read_rate)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (provider, model) DO UPDATE SET
                input_rate = EXCLUDED.input_rate,
                output_rate = EXCLUDED.output_rate,
                cache_write_rate = EXCLUDED.cache_write_rate,
                cache_read_rate = EXCLUDED.cache_read_rate
            "#,
        )
        .bind(&row.provider)
        .bind(&row.model)
        .bind(row.input_rate)
        .bind(row.output_rate)
        .bind(row.cache_write_rate)
        .bind(row.cache_read_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_pricing(&self, provider: &str, model: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM model_pricing WHERE provider = $1 AND model = $2")
            .bind(provider)
            .bind(model)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, batch), fields(tx_seq = batch.tx_seq), err)]
    async fn insert_batch(&self, batch: &NewBatch) -> Result<BatchRow> {
        let row = sqlx::query_as::<_, BatchDbRow>(
            r#"
            INSERT INTO anchor_batches (
                merkle_root, chain_hash, tx_seq, prev_tx_seq, anchor_tx, block_height, log_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, merkle_root, chain_hash, tx_seq, prev_tx_seq, anchor_tx, block_height,
                      log_count, created_at
            "#,
        )
        .bind(&batch.merkle_root)
        .bind(&batch.chain_hash)
        .bind(batch.tx_seq)
        .bind(batch.prev_tx_seq)
        .bind(&batch.anchor_tx)
        .bind(batch.block_height)
        .bind(batch.log_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    #[instrument(skip(self), err)]
    async fn get_batch(&self, id: i64) -> Result<Option<BatchRow>> {
        let row = sqlx::query_as::<_, BatchDbRow>(
            "SELECT id, merkle_root, chain_hash, tx_seq, prev_tx_seq, anchor_tx, block_height, \
             log_count, created_at FROM anchor_batches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), err)]
    async fn list_batches(&self, limit: i64) -> Result<Vec<BatchRow>> {
        let rows = sqlx::query_as::<_, BatchDbRow>(
            "SELECT id, merkle_root, chain_hash, tx_seq, prev_tx_seq, anchor_tx, block_height, \
             log_count, created_at FROM anchor_batches ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn max_anchor_sequence(&self) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(tx_seq) FROM anchor_batches")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    #[instrument(skip(self, attachments), fields(count = attachments.len()), err)]
    async fn attach_proofs(&self, attachments: &[ProofAttachment]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for attachment in attachments {
            // batch_id IS NULL guards immutability of anchored records.
            sqlx::query(
                r#"
                UPDATE usage_logs
                SET batch_id = $2, leaf_hash = $3, merkle_proof = $4, anchor_tx = $5
                WHERE id = $1 AND batch_id IS NULL
                "#,
            )
            .bind(attachment.log_id)
            .bind(attachment.batch_id)
            .bind(&attachment.leaf_hash)
            .bind(Json(&attachment.merkle_proof))
            .bind(&attachment.anchor_tx)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn bump_request_count(&self, period: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO anchor_budget (period, request_count, last_updated)
            VALUES ($1, 1, NOW())
            ON CONFLICT (period) DO UPDATE SET
                request_count = anchor_budget.request_count + 1,
                last_updated = NOW()
            "#,
        )
        .bind(period)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn bump_anchor_tx_count(&self, period: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO anchor_budget (period, tx_count, last_updated)
            VALUES ($1, 1, NOW())
            ON CONFLICT (period) DO UPDATE SET
                tx_count = anchor_budget.tx_count + 1,
                last_updated = NOW()
            "#,
        )
        .bind(period)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_budget(&self, period: NaiveDate) -> Result<BudgetRow> {
        #[derive(FromRow)]
        struct BudgetDbRow {
            period: NaiveDate,
            tx_count: i32,
            request_count: i64,
            last_updated: DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, BudgetDbRow>(
            "SELECT period, tx_count, request_count, last_updated FROM anchor_budget WHERE period = $1",
        )
        .bind(period)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| BudgetRow {
                period: r.period,
                tx_count: r.tx_count,
                request_count: r.request_count,
                last_updated: r.last_updated,
            })
            .unwrap_or_else(|| BudgetRow::empty(period)))
    }
}

#[derive(FromRow)]
struct PricingDbRow {
    provider: String,
    model: String,
    input_rate: Decimal,
    output_rate: Decimal,
    cache_write_rate: Option<Decimal>,
    cache_read_rate: Option<Decimal>,
}

impl From<PricingDbRow> for PricingRow {
    fn from(row: PricingDbRow) -> Self {
        PricingRow {
            provider: row.provider,
            model: row.model,
            input_rate: row.input_rate,
            output_rate: row.output_rate,
            cache_write_rate: row.cache_write_rate,
            cache_read_rate: row.cache_read_rate,
        }
    }
}
