//! Shamir threshold secret sharing over GF(2^61 - 1).
//!
//! A secret is split into 7-byte chunks; each chunk is the constant term of
//! its own random polynomial of degree T-1. Share `i` holds every polynomial
//! evaluated at x = i (1..=N, zero is reserved for the secret). Shares are
//! sealed under the system key and carry a Merkle proof against the
//! instance-wide commitment, so a holder can check their share without
//! reconstructing anything.

use crate::commitment::{self, MerkleTree, ShareCommitment, VerificationProof};
use crate::error::{Result, VaultError};
use crate::field::{self, FieldElement, ELEMENT_BYTES};
use a2a_crypto::{aead, SensitiveBytes32, SensitiveVec};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

/// Smallest meaningful threshold
pub const MIN_THRESHOLD: usize = 2;

/// Share coordinates are 1..=255
pub const MAX_SHARES: usize = 255;

/// Upper bound on the secret size accepted for splitting
pub const MAX_SECRET_LEN: usize = 64 * 1024;

/// One custodian's share of a distributed secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedKeyShare {
    pub share_id: String,
    pub instance_id: Uuid,
    pub threshold: u8,
    pub total_shares: u8,
    pub share_index: u8,
    pub secret_len: usize,
    /// nonce || XChaCha20-Poly1305(evaluations)
    pub encrypted_share: Vec<u8>,
    pub public_commitment: ShareCommitment,
    pub verification_proof: VerificationProof,
    pub created_at: DateTime<Utc>,
}

/// Split/reconstruct service holding the key that seals shares at rest
pub struct ThresholdSecretSharing {
    system_key: SensitiveBytes32,
}

fn share_aad(instance: &Uuid, index: u8, commitment: &ShareCommitment) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 1 + 32);
    aad.extend_from_slice(instance.as_bytes());
    aad.push(index);
    aad.extend_from_slice(commitment.0.as_bytes());
    aad
}

fn validate_parameters(secret_len: usize, threshold: usize, total: usize) -> Result<()> {
    if threshold < MIN_THRESHOLD {
        return Err(VaultError::Validation(format!(
            "threshold {} is below the minimum of {}",
            threshold, MIN_THRESHOLD
        )));
    }
    if threshold > total {
        return Err(VaultError::Validation(format!(
            "threshold {} exceeds total shares {}",
            threshold, total
        )));
    }
    if total > MAX_SHARES {
        return Err(VaultError::Validation(format!(
            "total shares {} exceeds the maximum of {}",
            total, MAX_SHARES
        )));
    }
    if secret_len == 0 {
        return Err(VaultError::Validation("secret is empty".to_string()));
    }
    if secret_len > MAX_SECRET_LEN {
        return Err(VaultError::Validation(format!(
            "secret of {} bytes exceeds the maximum of {}",
            secret_len, MAX_SECRET_LEN
        )));
    }
    Ok(())
}

impl ThresholdSecretSharing {
    /// Create a sharing service with a fresh random system key
    pub fn new() -> Self {
        Self::with_system_key(aead::generate_key())
    }

    /// Create a sharing service sealing shares under `system_key`
    pub fn with_system_key(system_key: SensitiveBytes32) -> Self {
        Self { system_key }
    }

    /// Split `secret` into `total` shares, any `threshold` of which reconstruct it.
    pub fn generate_distributed_key_shares(
        &self,
        secret: &[u8],
        threshold: usize,
        total: usize,
    ) -> Result<Vec<DistributedKeyShare>> {
        validate_parameters(secret.len(), threshold, total)?;

        let mut rng = rand::rngs::OsRng;
        let instance_id = Uuid::new_v4();
        let created_at = Utc::now();
        let (t, n) = (threshold as u8, total as u8);

        // One polynomial per chunk, secret chunk as the constant term
        let mut polynomials: Vec<Vec<FieldElement>> = field::encode_chunks(secret)
            .into_iter()
            .map(|constant| {
                let mut coefficients = Vec::with_capacity(threshold);
                coefficients.push(constant);
                coefficients.extend((1..threshold).map(|_| FieldElement::random(&mut rng)));
                coefficients
            })
            .collect();

        let mut payloads: Vec<Zeroizing<Vec<u8>>> = Vec::with_capacity(total);
        let mut salts: Vec<[u8; 32]> = Vec::with_capacity(total);
        let mut leaves = Vec::with_capacity(total);

        for index in 1..=n {
            let x = FieldElement::new(index as u64);
            let mut payload = Zeroizing::new(Vec::with_capacity(polynomials.len() * ELEMENT_BYTES));
            for coefficients in &polynomials {
                payload.extend_from_slice(&field::evaluate(coefficients, x).value().to_be_bytes());
            }

            let mut salt = [0u8; 32];
            rng.fill_bytes(&mut salt);

            leaves.push(commitment::leaf_hash(&instance_id, index, &payload, &salt));
            payloads.push(payload);
            salts.push(salt);
        }
        polynomials.zeroize();

        let tree = MerkleTree::from_leaf_hashes(leaves);
        let root = tree
            .root()
            .ok_or_else(|| VaultError::Validation("no shares to commit".to_string()))?;
        let public_commitment = commitment::commit(&instance_id, t, n, secret.len(), &root);

        let mut shares = Vec::with_capacity(total);
        for (position, (payload, salt)) in payloads.iter().zip(salts).enumerate() {
            let share_index = (position + 1) as u8;
            let siblings = tree.prove(position).ok_or_else(|| {
                VaultError::Validation(format!("no proof for share {}", share_index))
            })?;
            let aad = share_aad(&instance_id, share_index, &public_commitment);

            shares.push(DistributedKeyShare {
                share_id: format!("{}-{}", instance_id, share_index),
                instance_id,
                threshold: t,
                total_shares: n,
                share_index,
                secret_len: secret.len(),
                encrypted_share: aead::seal(&self.system_key, payload, &aad)?,
                public_commitment,
                verification_proof: VerificationProof { salt, siblings },
                created_at,
            });
        }

        debug!(
            instance = %instance_id,
            threshold,
            total,
            secret_len = secret.len(),
            "Generated distributed key shares"
        );

        Ok(shares)
    }

    /// Decrypt a share and check it against the instance commitment.
    ///
    /// Returns the share's evaluations, one per chunk.
    pub fn verify_share(&self, share: &DistributedKeyShare) -> Result<Vec<FieldElement>> {
        if share.share_index == 0 || share.share_index > share.total_shares {
            return Err(VaultError::ShareInvalid(format!(
                "share index {} outside 1..={}",
                share.share_index, share.total_shares
            )));
        }
        if (share.threshold as usize) < MIN_THRESHOLD || share.threshold > share.total_shares {
            return Err(VaultError::ShareInvalid(format!(
                "threshold {} invalid for {} shares",
                share.threshold, share.total_shares
            )));
        }

        let aad = share_aad(&share.instance_id, share.share_index, &share.public_commitment);
        let payload = aead::open(&self.system_key, &share.encrypted_share, &aad).map_err(|_| {
            VaultError::ShareInvalid(format!("share {} failed to decrypt", share.share_id))
        })?;

        let chunks = field::chunk_count(share.secret_len);
        if payload.len() != chunks * ELEMENT_BYTES {
            return Err(VaultError::ShareInvalid(format!(
                "share {} carries {} bytes, expected {}",
                share.share_id,
                payload.len(),
                chunks * ELEMENT_BYTES
            )));
        }

        let leaf = commitment::leaf_hash(
            &share.instance_id,
            share.share_index,
            payload.as_bytes(),
            &share.verification_proof.salt,
        );
        let root = commitment::root_from_proof(leaf, &share.verification_proof.siblings);
        let expected = commitment::commit(
            &share.instance_id,
            share.threshold,
            share.total_shares,
            share.secret_len,
            &root,
        );
        if expected != share.public_commitment {
            return Err(VaultError::ShareInvalid(format!(
                "share {} does not match its commitment",
                share.share_id
            )));
        }

        payload
            .as_bytes()
            .chunks(ELEMENT_BYTES)
            .map(|bytes| {
                let mut raw = [0u8; ELEMENT_BYTES];
                raw.copy_from_slice(bytes);
                FieldElement::from_canonical(u64::from_be_bytes(raw)).ok_or_else(|| {
                    VaultError::ShareInvalid(format!("share {} holds a non-canonical element", share.share_id))
                })
            })
            .collect()
    }

    /// Recover the secret from at least `threshold` distinct shares.
    pub fn reconstruct_secret_from_shares(&self, shares: &[DistributedKeyShare]) -> Result<SensitiveVec> {
        let first = shares
            .first()
            .ok_or(VaultError::InsufficientShares { have: 0, need: MIN_THRESHOLD })?;
        let need = first.threshold as usize;

        let mut distinct: BTreeMap<u8, &DistributedKeyShare> = BTreeMap::new();
        for share in shares {
            if share.instance_id != first.instance_id
                || share.threshold != first.threshold
                || share.total_shares != first.total_shares
                || share.secret_len != first.secret_len
                || share.public_commitment != first.public_commitment
            {
                return Err(VaultError::ShareInvalid(format!(
                    "share {} belongs to a different sharing instance",
                    share.share_id
                )));
            }
            if let Some(existing) = distinct.insert(share.share_index, share) {
                if existing != share {
                    return Err(VaultError::ShareInvalid(format!(
                        "conflicting shares for index {}",
                        share.share_index
                    )));
                }
            }
        }

        if distinct.len() < need {
            return Err(VaultError::InsufficientShares { have: distinct.len(), need });
        }

        let mut points: Vec<(FieldElement, Vec<FieldElement>)> = Vec::with_capacity(distinct.len());
        for (index, share) in &distinct {
            points.push((FieldElement::new(*index as u64), self.verify_share(share)?));
        }

        let (base, extra) = points.split_at(need);
        let chunks = field::chunk_count(first.secret_len);
        let mut recovered = Zeroizing::new(Vec::with_capacity(chunks));

        for chunk in 0..chunks {
            let basis: Vec<(FieldElement, FieldElement)> =
                base.iter().map(|(x, ys)| (*x, ys[chunk])).collect();

            let value = field::interpolate_at(&basis, FieldElement::ZERO).ok_or_else(|| {
                VaultError::InconsistentShares("duplicate share coordinates".to_string())
            })?;

            for (x, ys) in extra {
                let predicted = field::interpolate_at(&basis, *x).ok_or_else(|| {
                    VaultError::InconsistentShares("duplicate share coordinates".to_string())
                })?;
                if predicted != ys[chunk] {
                    return Err(VaultError::InconsistentShares(format!(
                        "share {} disagrees with the first {} shares",
                        x.value(),
                        need
                    )));
                }
            }

            recovered.push(value);
        }

        let secret = field::decode_chunks(&recovered, first.secret_len).ok_or_else(|| {
            VaultError::InconsistentShares("reconstructed value exceeds the secret width".to_string())
        })?;

        debug!(instance = %first.instance_id, used = distinct.len(), "Reconstructed secret from shares");

        Ok(SensitiveVec::new(secret))
    }
}

impl Default for ThresholdSecretSharing {
    fn default() -> Self {
        Self::new()
    }
}
