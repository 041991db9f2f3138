//! Low-level client for the on-chain anchoring contract.
//!
//! The contract sits behind an HTTP anchoring endpoint; submissions carry an
//! HMAC-SHA256 signature of the request body under the configured signing
//! key, plus the contract address. The wire shape mirrors the contract's
//! `recordBatch` / `getBatch` / `getLatestBatch` / `totalBatches` entry
//! points.
//!
//! [`MockChain`] is an in-process implementation used by the test suite; it
//! enforces the same sequence-collision rule as the real contract.

use crate::config::AnchoringConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::instrument;

const SIGNATURE_HEADER: &str = "x-anchor-signature";

#[derive(Debug, Error)]
pub enum AnchorError {
    /// The chain rejected the submission because the sequence number was
    /// already taken. This is the collision a racing submitter would hit;
    /// the serial pipeline exists so it never happens in practice.
    #[error("sequence {got} conflicts with chain head {expected}")]
    SequenceConflict { expected: u64, got: u64 },

    #[error("anchoring endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },

    #[error("anchoring transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for AnchorError {
    fn from(err: reqwest::Error) -> Self {
        AnchorError::Transport(err.to_string())
    }
}

/// A batch as recorded on the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBatch {
    pub batch_id: u64,
    pub merkle_root: String,
    pub chain_hash: String,
    pub log_count: u32,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub tx_id: String,
    pub block_height: u64,
}

/// Receipt for an accepted `recordBatch` submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    pub tx_id: String,
    pub block_height: u64,
    pub sequence: u64,
}

#[async_trait]
pub trait AnchorChain: Send + Sync {
    /// Pending-inclusive batch count; also the next free sequence number.
    async fn total_batches(&self) -> Result<u64, AnchorError>;

    /// Submit `recordBatch(root, chainHash, logCount)` at an explicit
    /// sequence. The chain rejects a sequence that is not its current head.
    async fn record_batch(
        &self,
        merkle_root: &str,
        chain_hash: &str,
        log_count: u32,
        sequence: u64,
    ) -> Result<AnchorReceipt, AnchorError>;

    async fn get_batch(&self, sequence: u64) -> Result<Option<ChainBatch>, AnchorError>;

    async fn latest_batch(&self) -> Result<Option<ChainBatch>, AnchorError>;
}

/// HTTP client against the anchoring endpoint.
pub struct HttpAnchorClient {
    http: reqwest::Client,
    endpoint: String,
    contract_address: String,
    signing_key: Vec<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordBatchBody<'a> {
    contract: &'a str,
    merkle_root: &'a str,
    chain_hash: &'a str,
    log_count: u32,
    sequence: u64,
}

#[derive(Deserialize)]
struct CountBody {
    count: u64,
}

#[derive(Deserialize)]
struct EndpointError {
    #[serde(default)]
    message: String,
}

impl HttpAnchorClient {
    pub fn new(config: &AnchoringConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(HttpAnchorClient {
            http,
            endpoint: config.endpoint.as_str().trim_end_matches('/').to_string(),
            contract_address: config.contract_address.clone(),
            signing_key: config.signing_key.as_bytes().to_vec(),
        })
    }

    fn sign(&self, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.signing_key)
            .expect("HMAC accepts any key length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    async fn read_error(response: reqwest::Response) -> AnchorError {
        let status = response.status().as_u16();
        let message = match response.json::<EndpointError>().await {
            Ok(body) => body.message,
            Err(_) => String::new(),
        };
        AnchorError::Endpoint { status, message }
    }
}

#[async_trait]
impl AnchorChain for HttpAnchorClient {
    #[instrument(skip(self), err)]
    async fn total_batches(&self) -> Result<u64, AnchorError> {
        let response = self
            .http
            .get(format!("{}/batches/count", self.endpoint))
            .query(&[("contract", self.contract_address.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response.json::<CountBody>().await?.count)
    }

    #[instrument(skip(self, merkle_root, chain_hash), err)]
    async fn record_batch(
        &self,
        merkle_root: &str,
        chain_hash: &str,
        log_count: u32,
        sequence: u64,
    ) -> Result<AnchorReceipt, AnchorError> {
        let body = serde_json::to_vec(&RecordBatchBody {
            contract: &self.contract_address,
            merkle_root,
            chain_hash,
            log_count,
            sequence,
        })
        .map_err(|e| AnchorError::Transport(e.to_string()))?;

        let response = self
            .http
            .post(format!("{}/batches", self.endpoint))
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, self.sign(&body))
            .body(body)
            .send()
            .await?;

        if response.status().as_u16() == 409 {
            let head = self.total_batches().await.unwrap_or(0);
            return Err(AnchorError::SequenceConflict {
                expected: head,
                got: sequence,
            });
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response.json::<AnchorReceipt>().await?)
    }

    #[instrument(skip(self), err)]
    async fn get_batch(&self, sequence: u64) -> Result<Option<ChainBatch>, AnchorError> {
        let response = self
            .http
            .get(format!("{}/batches/{sequence}", self.endpoint))
            .query(&[("contract", self.contract_address.as_str())])
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(Some(response.json::<ChainBatch>().await?))
    }

    #[instrument(skip(self), err)]
    async fn latest_batch(&self) -> Result<Option<ChainBatch>, AnchorError> {
        let response = self
            .http
            .get(format!("{}/batches/latest", self.endpoint))
            .query(&[("contract", self.contract_address.as_str())])
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(Some(response.json::<ChainBatch>().await?))
    }
}

/// In-process chain for tests. Accepts a submission only at the current
/// head sequence, like the contract.
#[derive(Default)]
pub struct MockChain {
    batches: Mutex<Vec<ChainBatch>>,
    fail_next: AtomicBool,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `record_batch` call fail with a transport error.
    pub fn fail_next_submission(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<ChainBatch> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl AnchorChain for MockChain {
    async fn total_batches(&self) -> Result<u64, AnchorError> {
        Ok(self.batches.lock().len() as u64)
    }

    async fn record_batch(
        &self,
        merkle_root: &str,
        chain_hash: &str,
        log_count: u32,
        sequence: u64,
    ) -> Result<AnchorReceipt, AnchorError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AnchorError::Transport("injected failure".to_string()));
        }
        let mut batches = self.batches.lock();
        let head = batches.len() as u64;
        if sequence != head {
            return Err(AnchorError::SequenceConflict {
                expected: head,
                got: sequence,
            });
        }
        let batch = ChainBatch {
            batch_id: sequence,
            merkle_root: merkle_root.to_string(),
            chain_hash: chain_hash.to_string(),
            log_count,
            sequence,
            timestamp: Utc::now(),
            tx_id: format!("mock-tx-{sequence}"),
            block_height: sequence + 1,
        };
        let receipt = AnchorReceipt {
            tx_id: batch.tx_id.clone(),
            block_height: batch.block_height,
            sequence,
        };
        batches.push(batch);
        Ok(receipt)
    }

    async fn get_batch(&self, sequence: u64) -> Result<Option<ChainBatch>, AnchorError> {
        Ok(self
            .batches
            .lock()
            .iter()
            .find(|b| b.sequence == sequence)
            .cloned())
    }

    async fn latest_batch(&self) -> Result<Option<ChainBatch>, AnchorError> {
        Ok(self.batches.lock().last().cloned())
    }
}
