//! Durable state behind the gateway: consumer quotas, the usage audit log,
//! model pricing rows, anchor batches and the daily anchoring budget.
//!
//! All access goes through the [`GatewayStore`] trait so the HTTP layer and
//! the anchoring pipeline are storage-agnostic. [`postgres::PostgresStore`]
//! is the production implementation; [`in_memory::InMemoryStore`] backs the
//! test suite and local experiments.

pub mod in_memory;
pub mod postgres;


use crate::merkle::MerkleProof;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for store operations that application code can handle.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("entity not found")]
    NotFound,

    #[error("unique constraint violation: {message}")]
    UniqueViolation {
        constraint: Option<String>,
        message: String,
    },

    /// Catch-all for non-recoverable errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::UniqueViolation {
                    constraint: db_err.constraint().map(|s| s.to_string()),
                    message: db_err.message().to_string(),
                }
            }
            _ => StoreError::Other(anyhow::Error::from(err)),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One consumer's spending quota and running total.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerQuota {
    pub consumer_id: String,
    pub display_name: Option<String>,
    pub external_id: Option<String>,
    pub quota: Decimal,
    pub used: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A usage log row as inserted at response completion. Anchoring fields are
/// attached later by the pipeline.
#[derive(Debug, Clone)]
pub struct NewUsageLog {
    pub consumer_id: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cost: Decimal,
    pub status: i32,
    pub estimated: bool,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub request_hash: String,
    pub response_hash: String,
}

/// A persisted usage log row.
#[derive(Debug, Clone, Serialize)]
pub struct UsageLog {
    pub id: Uuid,
    pub consumer_id: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cost: Decimal,
    pub status: i32,
    pub estimated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub request_hash: String,
    pub response_hash: String,
    pub batch_id: Option<i64>,
    pub leaf_hash: Option<String>,
    pub merkle_proof: Option<MerkleProof>,
    pub anchor_tx: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One per-(provider, model) pricing row. `model = ""` is a provider-wide
/// default row; lookups never fall back to it implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRow {
    pub provider: String,
    pub model: String,
    pub input_rate: Decimal,
    pub output_rate: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_rate: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_rate: Option<Decimal>,
}

/// An anchored batch awaiting persistence.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub merkle_root: String,
    pub chain_hash: String,
    pub tx_seq: i64,
    pub prev_tx_seq: i64,
    pub anchor_tx: String,
    pub block_height: i64,
    pub log_count: i32,
}

/// A persisted anchor batch row.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRow {
    pub id: i64,
    pub merkle_root: String,
    pub chain_hash: String,
    pub tx_seq: i64,
    pub prev_tx_seq: i64,
    pub anchor_tx: String,
    pub block_height: i64,
    pub log_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Merkle proof material written back onto a usage log after its batch has
/// been anchored.
#[derive(Debug, Clone)]
pub struct ProofAttachment {
    pub log_id: Uuid,
    pub batch_id: i64,
    pub leaf_hash: String,
    pub merkle_proof: MerkleProof,
    pub anchor_tx: String,
}

/// One calendar day's anchoring-budget counters.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetRow {
    pub period: NaiveDate,
    pub tx_count: i32,
    pub request_count: i64,
    pub last_updated: DateTime<Utc>,
}

impl BudgetRow {
    pub fn empty(period: NaiveDate) -> Self {
        BudgetRow {
            period,
            tx_count: 0,
            request_count: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Aggregate token and cost totals for one consumer.
#[derive(Debug, Clone, Serialize)]
pub struct UsageTotals {
    pub consumer_id: String,
    pub calls: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: Decimal,
}

/// Storage contract for the gateway's durable state.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// Fetch a consumer, creating it with the default quota on first sight.
    async fn get_or_create_consumer(
        &self,
        consumer_id: &str,
        display_name: Option<&str>,
        external_id: Option<&str>,
        default_quota: Decimal,
    ) -> Result<ConsumerQuota>;

    async fn get_consumer(&self, consumer_id: &str) -> Result<Option<ConsumerQuota>>;

    /// Replace a consumer's total quota. `NotFound` if the consumer does not
    /// exist.
    async fn set_consumer_quota(&self, consumer_id: &str, quota: Decimal) -> Result<ConsumerQuota>;

    /// Insert the audit row and debit the consumer's quota by `log.cost` in
    /// one transaction. The debit is a single `used = used + cost` update;
    /// there is no pre-reservation, so concurrent calls can overshoot the
    /// quota by at most the in-flight cost.
    async fn record_usage(&self, log: NewUsageLog) -> Result<UsageLog>;

    async fn get_usage_log(&self, id: Uuid) -> Result<Option<UsageLog>>;

    async fn list_usage_logs(
        &self,
        consumer_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UsageLog>>;

    async fn usage_totals(&self) -> Result<Vec<UsageTotals>>;

    /// Usage logs with null anchoring fields created before `older_than`,
    /// oldest first. Feeds the retry sweep.
    async fn list_unanchored(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UsageLog>>;

    async fn list_pricing(&self) -> Result<Vec<PricingRow>>;

    async fn upsert_pricing(&self, row: &PricingRow) -> Result<()>;

    async fn delete_pricing(&self, provider: &str, model: &str) -> Result<bool>;

    async fn insert_batch(&self, batch: &NewBatch) -> Result<BatchRow>;

    async fn get_batch(&self, id: i64) -> Result<Option<BatchRow>>;

    async fn list_batches(&self, limit: i64) -> Result<Vec<BatchRow>>;

    /// Highest anchoring sequence persisted so far, if any.
    async fn max_anchor_sequence(&self) -> Result<Option<i64>>;

    /// Attach Merkle proof material to the given logs. Only logs whose
    /// anchoring fields are still null are written: once a record belongs to
    /// a batch its leaf hash and proof are immutable.
    async fn attach_proofs(&self, attachments: &[ProofAttachment]) -> Result<()>;

    /// Atomically count one client request against the given day.
    async fn bump_request_count(&self, period: NaiveDate) -> Result<()>;

    /// Atomically count one anchoring transaction against the given day.
    async fn bump_anchor_tx_count(&self, period: NaiveDate) -> Result<()>;

    /// The day's budget counters; a zero row when nothing happened yet.
    async fn get_budget(&self, period: NaiveDate) -> Result<BudgetRow>;
}
