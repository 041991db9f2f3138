//! Tamper-evident audit anchoring: batching, Merkle commitment, serial
//! on-chain submission and proof verification.
//!
//! Many audit records collapse into one Merkle root and one anchoring
//! transaction. Successive batches are linked by a chain hash that commits
//! to the previous anchor's sequence number, so any break in the sequence is
//! detectable off-chain.

pub mod batcher;
pub mod client;
pub mod pipeline;
pub mod sweeper;

use crate::merkle::sha256;
use crate::store::UsageLog;
use serde::Serialize;
use uuid::Uuid;

/// The fields of an audit record committed into its Merkle leaf.
///
/// Field order is the canonical key order of the leaf encoding; serde emits
/// struct fields in declaration order, so this struct must stay sorted by
/// its camelCase key names.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    pub completion_tokens: i64,
    pub consumer_id: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub provider: String,
    pub request_hash: String,
    pub response_hash: String,
    /// Not part of the committed encoding; used to attach the proof.
    #[serde(skip)]
    pub log_id: Uuid,
}

impl PendingRecord {
    pub fn from_log(log: &UsageLog) -> Self {
        PendingRecord {
            completion_tokens: log.completion_tokens,
            consumer_id: log.consumer_id.clone(),
            model: log.model.clone(),
            prompt_tokens: log.prompt_tokens,
            provider: log.provider.clone(),
            request_hash: log.request_hash.clone(),
            response_hash: log.response_hash.clone(),
            log_id: log.id,
        }
    }

    /// Deterministic key-ordered JSON encoding of the committed fields.
    pub fn canonical(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("canonical record encoding cannot fail")
    }

    /// SHA-256 of the canonical encoding.
    pub fn leaf_hash(&self) -> [u8; 32] {
        sha256(&self.canonical())
    }
}

/// Chain hash linking a batch to its predecessor:
/// `H(merkle_root || prev_seq)` with the previous sequence as 8-byte
/// big-endian. The genesis batch (sequence 0) uses `prev = 0`.
pub fn chain_hash(root: &[u8; 32], prev_seq: u64) -> [u8; 32] {
    let mut data = [0u8; 40];
    data[..32].copy_from_slice(root);
    data[32..].copy_from_slice(&prev_seq.to_be_bytes());
    sha256(&data)
}

/// How one enqueued record's anchoring concluded. Settled exactly once per
/// enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorOutcome {
    Anchored { batch_id: i64, anchor_tx: String },
    /// The daily transaction budget is spent; the record stays unanchored
    /// until the next day. The caller is never blocked on this.
    BudgetExhausted,
    Failed { reason: String },
}
