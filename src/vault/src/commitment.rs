//! Share commitments.
//!
//! Every share of a sharing instance becomes a leaf of a BLAKE3 Merkle tree:
//!
//! ```text
//!   leaf(i)        = BLAKE3(0x00 || instance || i || evaluations(i) || salt(i))
//!   internal(l, r) = BLAKE3(0x01 || l || r)
//!   commitment     = H("a2a-keyx/share-commitment", instance, T, N, len, root)
//! ```
//!
//! The N evaluations fix the polynomials, so the root binds the whole sharing.
//! A holder proves their share belongs to it with the salt and the sibling
//! path; no other share is revealed. Odd nodes are promoted, not duplicated.

use a2a_crypto::Blake3Hash;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LEAF_PREFIX: u8 = 0x00;
const INTERNAL_PREFIX: u8 = 0x01;
const COMMITMENT_CONTEXT: &[u8] = b"a2a-keyx/share-commitment";

/// Public commitment shared by every share of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShareCommitment(pub Blake3Hash);

/// Position of a sibling relative to the running hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Left,
    Right,
}

/// Per-share proof of membership in the committed sharing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationProof {
    pub salt: [u8; 32],
    pub siblings: Vec<(Position, [u8; 32])>,
}

/// Hash a share leaf with domain separation.
pub fn leaf_hash(instance: &Uuid, index: u8, evaluations: &[u8], salt: &[u8; 32]) -> [u8; 32] {
    let mut input = Vec::with_capacity(1 + 16 + 1 + evaluations.len() + 32);
    input.push(LEAF_PREFIX);
    input.extend_from_slice(instance.as_bytes());
    input.push(index);
    input.extend_from_slice(evaluations);
    input.extend_from_slice(salt);
    *Blake3Hash::hash(&input).as_bytes()
}

/// Hash two child nodes to produce a parent.
pub fn internal_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut input = [0u8; 65];
    input[0] = INTERNAL_PREFIX;
    input[1..33].copy_from_slice(left);
    input[33..].copy_from_slice(right);
    *Blake3Hash::hash(&input).as_bytes()
}

/// Bind the Merkle root to the parameters of the sharing.
pub fn commit(instance: &Uuid, threshold: u8, total: u8, secret_len: usize, root: &[u8; 32]) -> ShareCommitment {
    ShareCommitment(Blake3Hash::hash_parts(&[
        COMMITMENT_CONTEXT,
        instance.as_bytes(),
        &[threshold, total],
        &(secret_len as u64).to_le_bytes(),
        root,
    ]))
}

/// Fold a leaf hash up its sibling path.
pub fn root_from_proof(leaf: [u8; 32], siblings: &[(Position, [u8; 32])]) -> [u8; 32] {
    siblings.iter().fold(leaf, |current, (position, sibling)| match position {
        Position::Left => internal_hash(sibling, &current),
        Position::Right => internal_hash(&current, sibling),
    })
}

/// A BLAKE3 Merkle tree over share leaves.
pub struct MerkleTree {
    /// levels[0] = leaves, levels[last] = [root]
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    pub fn from_leaf_hashes(leaves: Vec<[u8; 32]>) -> Self {
        let mut levels = vec![leaves];

        loop {
            let current = match levels.last() {
                Some(level) if level.len() > 1 => level,
                _ => break,
            };
            let mut next = Vec::with_capacity(current.len().div_ceil(2));

            let mut i = 0;
            while i + 1 < current.len() {
                next.push(internal_hash(&current[i], &current[i + 1]));
                i += 2;
            }
            // Odd node: promote without duplication
            if i < current.len() {
                next.push(current[i]);
            }

            levels.push(next);
        }

        Self { levels }
    }

    pub fn root(&self) -> Option<[u8; 32]> {
        self.levels.last()?.first().copied()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, |l| l.len())
    }

    /// Sibling path for the leaf at zero-based `index`.
    pub fn prove(&self, index: usize) -> Option<Vec<(Position, [u8; 32])>> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut siblings = Vec::new();
        let mut idx = index;

        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            if sibling_idx < level.len() {
                let position = if idx % 2 == 0 { Position::Right } else { Position::Left };
                siblings.push((position, level[sibling_idx]));
            }
            idx /= 2;
        }

        Some(siblings)
    }
}
