//! Merkle tree construction, proof emission and proof verification.
//!
//! Leaves are SHA-256 digests supplied by the caller. Levels are built by
//! pairwise concatenation (`parent = H(left || right)`); an odd trailing node
//! at any level is carried up unchanged, so a proof for that node simply has
//! no sibling entry at that level.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 over an arbitrary byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// One step of a Merkle inclusion proof: the sibling digest and on which
/// side of the concatenation it sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    /// Hex-encoded sibling digest.
    pub sibling: String,
    /// True when the sibling is the left operand of the parent hash.
    pub left: bool,
}

/// Ordered sibling path from a leaf up to (but excluding) the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub nodes: Vec<ProofNode>,
}

/// A fully materialised Merkle tree. Level 0 holds the leaves; the last
/// level holds the single root.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Build a tree from one or more leaf digests. Returns `None` for an
    /// empty slice: an empty batch has no root.
    pub fn build(leaves: &[[u8; 32]]) -> Option<MerkleTree> {
        if leaves.is_empty() {
            return None;
        }
        let mut levels = vec![leaves.to_vec()];
        while levels.last().unwrap().len() > 1 {
            let current = levels.last().unwrap();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                match pair {
                    [left, right] => {
                        let mut hasher = Sha256::new();
                        hasher.update(left);
                        hasher.update(right);
                        next.push(hasher.finalize().into());
                    }
                    // Odd trailing node: carried up unchanged.
                    [lone] => next.push(*lone),
                    _ => unreachable!(),
                }
            }
            levels.push(next);
        }
        Some(MerkleTree { levels })
    }

    pub fn root(&self) -> [u8; 32] {
        self.levels.last().unwrap()[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut nodes = Vec::new();
        let mut idx = index;
        // Walk every level below the root.
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = idx ^ 1;
            if sibling_idx < level.len() {
                nodes.push(ProofNode {
                    sibling: hex::encode(level[sibling_idx]),
                    left: sibling_idx < idx,
                });
            }
            idx /= 2;
        }
        Some(MerkleProof { nodes })
    }
}

/// Recompute the root from a leaf and its sibling path and compare.
///
/// Returns false on any mismatch, including undecodable sibling digests.
pub fn verify_proof(leaf: [u8; 32], proof: &MerkleProof, root: [u8; 32]) -> bool {
    let mut current = leaf;
    for node in &proof.nodes {
        let Ok(sibling) = hex::decode(&node.sibling) else {
            return false;
        };
        if sibling.len() != 32 {
            return false;
        }
        let mut hasher = Sha256::new();
        if node.left {
            hasher.update(&sibling);
            hasher.update(current);
        } else {
            hasher.update(current);
            hasher.update(&sibling);
        }
        current = hasher.finalize().into();
    }
    current == root
}
