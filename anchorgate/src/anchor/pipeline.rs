//! Serial anchor submission and off-chain verification.
//!
//! All anchor submissions flow through one dedicated task fed by an mpsc
//! channel. The sequence number fetched in step one of a submission is only
//! valid until the next submission lands, so two concurrent submitters
//! would race to the same sequence and one would be rejected by the chain;
//! funnelling every batch through this task makes the fetch-compute-submit
//! triple atomic with respect to other batches.

use super::client::{AnchorChain, AnchorError};
use super::{PendingRecord, chain_hash};
use crate::merkle::{MerkleTree, verify_proof};
use crate::store::{GatewayStore, NewBatch, ProofAttachment};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot anchor an empty batch")]
    EmptyBatch,

    #[error(transparent)]
    Chain(#[from] AnchorError),

    #[error("failed to persist anchored batch: {0}")]
    Store(String),

    #[error("anchoring pipeline is shut down")]
    Closed,
}

/// A successfully anchored batch.
#[derive(Debug, Clone)]
pub struct AnchoredBatch {
    pub batch_id: i64,
    pub anchor_tx: String,
    pub tx_seq: u64,
    pub merkle_root: String,
}

struct SubmitJob {
    records: Vec<PendingRecord>,
    reply: oneshot::Sender<Result<AnchoredBatch, PipelineError>>,
}

/// Producer half of the serial submission queue.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<SubmitJob>,
}

impl PipelineHandle {
    /// Submit one batch and wait for its anchoring to conclude. Batches are
    /// processed strictly in submission order.
    pub async fn submit(&self, records: Vec<PendingRecord>) -> Result<AnchoredBatch, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SubmitJob { records, reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        rx.await.map_err(|_| PipelineError::Closed)?
    }
}

/// Spawn the pipeline task. Dropping every [`PipelineHandle`] stops it.
pub fn spawn(
    store: Arc<dyn GatewayStore>,
    chain: Arc<dyn AnchorChain>,
) -> (PipelineHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<SubmitJob>(64);
    let task = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = anchor_batch(store.as_ref(), chain.as_ref(), &job.records).await;
            if let Err(e) = &result {
                warn!(error = %e, records = job.records.len(), "Anchor submission failed");
            }
            // The batcher may have given up waiting; nothing to do then.
            let _ = job.reply.send(result);
        }
    });
    (PipelineHandle { tx }, task)
}

/// Anchor one batch: build the Merkle tree, fetch the next sequence, link
/// the chain hash, submit, then persist the batch row and per-record proofs.
#[instrument(skip_all, fields(records = records.len()))]
async fn anchor_batch(
    store: &dyn GatewayStore,
    chain: &dyn AnchorChain,
    records: &[PendingRecord],
) -> Result<AnchoredBatch, PipelineError> {
    let leaves: Vec<[u8; 32]> = records.iter().map(PendingRecord::leaf_hash).collect();
    let tree = MerkleTree::build(&leaves).ok_or(PipelineError::EmptyBatch)?;
    let root = tree.root();
    let root_hex = hex::encode(root);

    // The pending-inclusive batch count is the next free sequence.
    let seq = chain.total_batches().await?;
    let prev = seq.saturating_sub(1);
    let link = hex::encode(chain_hash(&root, prev));

    let receipt = chain
        .record_batch(&root_hex, &link, records.len() as u32, seq)
        .await?;

    if let Err(e) = store.bump_anchor_tx_count(Utc::now().date_naive()).await {
        warn!(error = %e, "Failed to count anchor transaction against the daily budget");
    }

    let batch = store
        .insert_batch(&NewBatch {
            merkle_root: root_hex.clone(),
            chain_hash: link,
            tx_seq: seq as i64,
            prev_tx_seq: prev as i64,
            anchor_tx: receipt.tx_id.clone(),
            block_height: receipt.block_height as i64,
            log_count: records.len() as i32,
        })
        .await
        .map_err(|e| PipelineError::Store(e.to_string()))?;

    let attachments: Vec<ProofAttachment> = records
        .iter()
        .enumerate()
        .map(|(i, record)| ProofAttachment {
            log_id: record.log_id,
            batch_id: batch.id,
            leaf_hash: hex::encode(leaves[i]),
            merkle_proof: tree.proof(i).expect("index within tree"),
            anchor_tx: receipt.tx_id.clone(),
        })
        .collect();
    store
        .attach_proofs(&attachments)
        .await
        .map_err(|e| PipelineError::Store(e.to_string()))?;

    info!(
        batch_id = batch.id,
        tx_seq = seq,
        log_count = records.len(),
        anchor_tx = %receipt.tx_id,
        "Anchored batch"
    );

    Ok(AnchoredBatch {
        batch_id: batch.id,
        anchor_tx: receipt.tx_id,
        tx_seq: seq,
        merkle_root: root_hex,
    })
}

/// Result of verifying one audit record's anchoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verification {
    fn invalid(reason: &str) -> Self {
        Verification {
            valid: false,
            reason: Some(reason.to_string()),
        }
    }

    fn valid() -> Self {
        Verification {
            valid: true,
            reason: None,
        }
    }
}

/// Verify a usage log's Merkle inclusion and its batch's chain linkage.
///
/// Checks, in order: the record is anchored; its batch row exists; the
/// anchoring transaction exists on-chain at the stored sequence with the
/// stored root; the recomputed leaf matches the stored leaf; the proof
/// re-derives the root; the stored chain hash links to the previous
/// sequence.
#[instrument(skip(store, chain), err)]
pub async fn verify_log(
    store: &dyn GatewayStore,
    chain: &dyn AnchorChain,
    log_id: Uuid,
) -> Result<Option<Verification>, crate::store::StoreError> {
    let Some(log) = store.get_usage_log(log_id).await? else {
        return Ok(None);
    };
    let (Some(batch_id), Some(stored_leaf), Some(proof)) =
        (log.batch_id, log.leaf_hash.as_deref(), log.merkle_proof.as_ref())
    else {
        return Ok(Some(Verification::invalid("not anchored")));
    };
    let Some(batch) = store.get_batch(batch_id).await? else {
        return Ok(Some(Verification::invalid("batch record missing")));
    };

    let on_chain = match chain.get_batch(batch.tx_seq as u64).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "Chain lookup failed during verification");
            return Ok(Some(Verification::invalid("anchor transaction unavailable")));
        }
    };
    let Some(on_chain) = on_chain else {
        return Ok(Some(Verification::invalid("anchor transaction not found")));
    };
    if on_chain.sequence != batch.tx_seq as u64 {
        return Ok(Some(Verification::invalid("sequence mismatch")));
    }
    if on_chain.merkle_root != batch.merkle_root {
        return Ok(Some(Verification::invalid("on-chain root mismatch")));
    }

    let recomputed = PendingRecord::from_log(&log).leaf_hash();
    if hex::encode(recomputed) != stored_leaf {
        return Ok(Some(Verification::invalid("leaf mismatch")));
    }

    let Ok(root_bytes) = hex::decode(&batch.merkle_root) else {
        return Ok(Some(Verification::invalid("undecodable root")));
    };
    let Ok(root_bytes) = <[u8; 32]>::try_from(root_bytes.as_slice()) else {
        return Ok(Some(Verification::invalid("undecodable root")));
    };
    if !verify_proof(recomputed, proof, root_bytes) {
        return Ok(Some(Verification::invalid("proof does not re-derive root")));
    }

    let expected_link = hex::encode(chain_hash(&root_bytes, batch.prev_tx_seq as u64));
    if expected_link != batch.chain_hash {
        return Ok(Some(Verification::invalid("chain hash mismatch")));
    }

    Ok(Some(Verification::valid()))
}

/// Startup reconciliation between the batch store and the chain.
///
/// A chain that is behind the store suggests a re-org or a misconfigured
/// endpoint; new anchors will follow the chain's view either way, so this
/// only warns.
pub async fn startup_check(store: &dyn GatewayStore, chain: &dyn AnchorChain) {
    let stored = match store.max_anchor_sequence().await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Could not read stored anchor sequence at startup");
            return;
        }
    };
    let on_chain = match chain.total_batches().await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Could not read chain batch count at startup");
            return;
        }
    };
    if let Some(stored) = stored {
        let expected = stored as u64 + 1;
        if on_chain < expected {
            warn!(
                stored_max_sequence = stored,
                chain_batches = on_chain,
                "Chain is behind the local batch store; possible re-org or misconfiguration. \
                 New anchors will use the chain's sequence."
            );
        } else {
            info!(stored_max_sequence = stored, chain_batches = on_chain, "Anchor state consistent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::client::MockChain;
    use crate::store::in_memory::InMemoryStore;
    use crate::store::NewUsageLog;
    use rust_decimal::Decimal;

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .get_or_create_consumer("alice", None, None, Decimal::from(5))
            .await
            .unwrap();
        store
    }

    async fn insert_log(store: &InMemoryStore, tag: u8) -> crate::store::UsageLog {
        store
            .record_usage(NewUsageLog {
                consumer_id: "alice".to_string(),
                provider: "openai".to_string(),
                model: "gpt-5".to_string(),
                prompt_tokens: 8 + tag as i64,
                completion_tokens: 12,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
                cost: Decimal::new(13, 5),
                status: 200,
                estimated: false,
                request_body: None,
                response_body: None,
                request_hash: hex::encode([tag; 32]),
                response_hash: hex::encode([tag.wrapping_add(1); 32]),
            })
            .await
            .unwrap()
    }

    async fn records(store: &InMemoryStore, n: u8) -> Vec<PendingRecord> {
        let mut out = Vec::new();
        for tag in 0..n {
            out.push(PendingRecord::from_log(&insert_log(store, tag).await));
        }
        out
    }

    #[tokio::test]
    async fn anchors_a_batch_and_persists_proofs() {
        let store = seeded_store().await;
        let chain = Arc::new(MockChain::new());
        let (handle, _task) = spawn(store.clone(), chain.clone());

        let batch = records(&store, 4).await;
        let log_ids: Vec<Uuid> = batch.iter().map(|r| r.log_id).collect();
        let anchored = handle.submit(batch).await.unwrap();
        assert_eq!(anchored.tx_seq, 0);

        for id in log_ids {
            let log = store.get_usage_log(id).await.unwrap().unwrap();
            assert_eq!(log.batch_id, Some(anchored.batch_id));
            assert!(log.leaf_hash.is_some());
            assert!(log.merkle_proof.is_some());
            assert_eq!(log.anchor_tx.as_deref(), Some("mock-tx-0"));
        }

        let budget = store.get_budget(Utc::now().date_naive()).await.unwrap();
        assert_eq!(budget.tx_count, 1);
    }

    #[tokio::test]
    async fn consecutive_batches_are_chain_linked() {
        let store = seeded_store().await;
        let chain = Arc::new(MockChain::new());
        let (handle, _task) = spawn(store.clone(), chain.clone());

        handle.submit(records(&store, 2).await).await.unwrap();
        handle.submit(records(&store, 3).await).await.unwrap();

        let batches = store.list_batches(10).await.unwrap();
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            let root: [u8; 32] = hex::decode(&batch.merkle_root)
                .unwrap()
                .try_into()
                .unwrap();
            let prev = if batch.tx_seq == 0 { 0 } else { batch.tx_seq as u64 - 1 };
            assert_eq!(batch.prev_tx_seq as u64, prev);
            assert_eq!(batch.chain_hash, hex::encode(chain_hash(&root, prev)));
        }
    }

    #[tokio::test]
    async fn concurrent_submissions_get_contiguous_sequences() {
        let store = seeded_store().await;
        let chain = Arc::new(MockChain::new());
        let (handle, _task) = spawn(store.clone(), chain.clone());

        let mut joins = Vec::new();
        for _ in 0..12 {
            let handle = handle.clone();
            let store = store.clone();
            joins.push(tokio::spawn(async move {
                let batch = records(&store, 1).await;
                handle.submit(batch).await.unwrap().tx_seq
            }));
        }
        let mut seqs = Vec::new();
        for join in joins {
            seqs.push(join.await.unwrap());
        }
        seqs.sort_unstable();
        let expected: Vec<u64> = (0..12).collect();
        assert_eq!(seqs, expected, "sequences must be strictly contiguous");
        assert_eq!(chain.total_batches().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn submission_failure_leaves_records_unanchored() {
        let store = seeded_store().await;
        let chain = Arc::new(MockChain::new());
        let (handle, _task) = spawn(store.clone(), chain.clone());

        let batch = records(&store, 2).await;
        let ids: Vec<Uuid> = batch.iter().map(|r| r.log_id).collect();
        chain.fail_next_submission();
        let err = handle.submit(batch).await.unwrap_err();
        assert!(matches!(err, PipelineError::Chain(_)));

        for id in ids {
            let log = store.get_usage_log(id).await.unwrap().unwrap();
            assert!(log.batch_id.is_none());
            assert!(log.merkle_proof.is_none());
        }
        // The failed submission spent no budget.
        let budget = store.get_budget(Utc::now().date_naive()).await.unwrap();
        assert_eq!(budget.tx_count, 0);

        // The pipeline keeps working afterwards.
        let next = records(&store, 1).await;
        assert_eq!(handle.submit(next).await.unwrap().tx_seq, 0);
    }

    #[tokio::test]
    async fn verify_accepts_anchored_and_rejects_tampered_records() {
        let store = seeded_store().await;
        let chain = Arc::new(MockChain::new());
        let (handle, _task) = spawn(store.clone(), chain.clone());

        let batch = records(&store, 4).await;
        let third = batch[2].log_id;
        handle.submit(batch).await.unwrap();

        let ok = verify_log(store.as_ref(), chain.as_ref(), third)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok, Verification::valid());

        // Tamper with the stored record in place; the recomputed leaf no
        // longer matches the committed one.
        store
            .inner
            .lock()
            .usage_logs
            .get_mut(&third)
            .unwrap()
            .response_hash = hex::encode([0xde; 32]);
        let bad = verify_log(store.as_ref(), chain.as_ref(), third)
            .await
            .unwrap()
            .unwrap();
        assert!(!bad.valid);
        assert_eq!(bad.reason.as_deref(), Some("leaf mismatch"));
    }

    #[tokio::test]
    async fn verify_reports_unanchored_and_unknown_records() {
        let store = seeded_store().await;
        let chain = MockChain::new();

        assert!(
            verify_log(store.as_ref(), &chain, Uuid::new_v4())
                .await
                .unwrap()
                .is_none()
        );

        let log = insert_log(&store, 1).await;
        let v = verify_log(store.as_ref(), &chain, log.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!v.valid);
        assert_eq!(v.reason.as_deref(), Some("not anchored"));
    }

    #[tokio::test]
    async fn verify_detects_missing_chain_transaction() {
        let store = seeded_store().await;
        let chain = Arc::new(MockChain::new());
        let (handle, _task) = spawn(store.clone(), chain.clone());

        let batch = records(&store, 1).await;
        let id = batch[0].log_id;
        handle.submit(batch).await.unwrap();

        // Verify against a different (empty) chain: the anchoring
        // transaction is not there.
        let other_chain = MockChain::new();
        let v = verify_log(store.as_ref(), &other_chain, id)
            .await
            .unwrap()
            .unwrap();
        assert!(!v.valid);
        assert_eq!(v.reason.as_deref(), Some("anchor transaction not found"));
    }

    #[tokio::test]
    async fn verify_detects_tampered_chain_hash() {
        let store = seeded_store().await;
        let chain = Arc::new(MockChain::new());
        let (handle, _task) = spawn(store.clone(), chain.clone());

        let batch = records(&store, 2).await;
        let id = batch[0].log_id;
        handle.submit(batch).await.unwrap();

        store.inner.lock().batches[0].chain_hash = hex::encode([0xaa; 32]);
        let v = verify_log(store.as_ref(), chain.as_ref(), id)
            .await
            .unwrap()
            .unwrap();
        assert!(!v.valid);
        assert_eq!(v.reason.as_deref(), Some("chain hash mismatch"));
    }
}
