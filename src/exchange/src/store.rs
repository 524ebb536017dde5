//! SharedSecretStore: one active record per unordered agent pair.
//!
//! Records are immutable once published. Rotation derives a complete new
//! record and swaps the `Arc` in one map operation, so a reader holds either
//! the old record or the new one, never a mix. Replaced records move to a
//! bounded per-pair audit trail.

use crate::clock;
use crate::config::KeyRotationPolicy;
use crate::context::EngineContext;
use crate::error::{ExchangeError, Result};
use crate::events::EngineEvent;
use crate::keys::{KeyAlgorithm, KeyPairManager, KeyStatus};
use a2a_crypto::{Blake3Hash, SensitiveBytes32, SessionKeys};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const KDF_DOMAIN: &[u8] = b"a2a-keyx/v1";

/// Unordered agent pair, stored sorted
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentPair {
    first: String,
    second: String,
}

impl AgentPair {
    pub fn new(a: &str, b: &str) -> Result<Self> {
        if a.is_empty() || b.is_empty() {
            return Err(ExchangeError::Validation("agent id is empty".to_string()));
        }
        if a == b {
            return Err(ExchangeError::Validation(format!(
                "agent {} cannot exchange keys with itself",
                a
            )));
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        Ok(Self {
            first: first.to_string(),
            second: second.to_string(),
        })
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.first == agent_id || self.second == agent_id
    }

    /// The other member of the pair
    pub fn peer_of(&self, agent_id: &str) -> Option<&str> {
        if self.first == agent_id {
            Some(&self.second)
        } else if self.second == agent_id {
            Some(&self.first)
        } else {
            None
        }
    }

    /// HKDF salt: domain tag followed by both ids, length-prefixed
    pub fn kdf_salt(&self) -> Vec<u8> {
        let mut salt = Vec::with_capacity(KDF_DOMAIN.len() + self.first.len() + self.second.len() + 8);
        salt.extend_from_slice(KDF_DOMAIN);
        for id in [&self.first, &self.second] {
            salt.extend_from_slice(&(id.len() as u32).to_be_bytes());
            salt.extend_from_slice(id.as_bytes());
        }
        salt
    }
}

impl fmt::Display for AgentPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.first, self.second)
    }
}

/// Session keys shared by one agent pair
#[derive(Debug)]
pub struct SharedSecret {
    pub secret_id: Uuid,
    pub pair: AgentPair,
    pub derived_keys: SessionKeys,
    /// Agent key ids this secret was derived from, in pair order
    pub source_keys: (String, String),
    pub algorithm: KeyAlgorithm,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rotation_scheduled: DateTime<Utc>,
    usage_count: AtomicU64,
    pub max_usage: u64,
    /// Exchange request that produced this record; `None` after rotation
    pub established_by: Option<Uuid>,
    /// 0 for an exchange, incremented by every rotation
    pub generation: u32,
}

/// Non-secret summary of a [`SharedSecret`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedSecretInfo {
    pub secret_id: Uuid,
    pub pair: AgentPair,
    pub source_keys: (String, String),
    pub algorithm: KeyAlgorithm,
    pub shared_secret_hash: Blake3Hash,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rotation_scheduled: DateTime<Utc>,
    pub usage_count: u64,
    pub max_usage: u64,
    pub generation: u32,
}

/// Inputs of one derivation
pub(crate) struct Derivation<'a> {
    pub pair: AgentPair,
    /// Raw agreement; dropped (and zeroized) by the caller right after
    pub raw: &'a SensitiveBytes32,
    pub source_keys: (String, String),
    pub algorithm: KeyAlgorithm,
    pub established_by: Option<Uuid>,
    pub generation: u32,
}

impl SharedSecret {
    pub(crate) fn derive(input: Derivation<'_>, policy: &KeyRotationPolicy, now: DateTime<Utc>) -> Result<Self> {
        let derived_keys = SessionKeys::derive(input.raw, &input.pair.kdf_salt())?;
        let expires_at = clock::after(now, policy.key_lifetime);

        Ok(SharedSecret {
            secret_id: Uuid::new_v4(),
            pair: input.pair,
            derived_keys,
            source_keys: input.source_keys,
            algorithm: input.algorithm,
            created_at: now,
            expires_at,
            rotation_scheduled: clock::after(now, policy.rotation_interval).min(expires_at),
            usage_count: AtomicU64::new(0),
            max_usage: policy.max_key_usage,
            established_by: input.established_by,
            generation: input.generation,
        })
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Acquire)
    }

    pub fn shared_secret_hash(&self) -> Blake3Hash {
        self.derived_keys.encryption_key_digest()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.usage_count() >= self.max_usage
    }

    pub fn info(&self) -> SharedSecretInfo {
        SharedSecretInfo {
            secret_id: self.secret_id,
            pair: self.pair.clone(),
            source_keys: self.source_keys.clone(),
            algorithm: self.algorithm,
            shared_secret_hash: self.shared_secret_hash(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            rotation_scheduled: self.rotation_scheduled,
            usage_count: self.usage_count(),
            max_usage: self.max_usage,
            generation: self.generation,
        }
    }

    /// Count one use, saturating at `max_usage`
    fn record_use(&self) -> u64 {
        let max = self.max_usage;
        match self
            .usage_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then(|| n + 1))
        {
            Ok(previous) => previous + 1,
            Err(current) => current,
        }
    }
}

pub struct SharedSecretStore {
    ctx: Arc<EngineContext>,
    keys: Arc<KeyPairManager>,
    active: DashMap<AgentPair, Arc<SharedSecret>>,
    superseded: DashMap<AgentPair, VecDeque<Arc<SharedSecret>>>,
    pending_rotation: DashSet<AgentPair>,
}

impl SharedSecretStore {
    pub(crate) fn new(ctx: Arc<EngineContext>, keys: Arc<KeyPairManager>) -> Self {
        Self {
            ctx,
            keys,
            active: DashMap::new(),
            superseded: DashMap::new(),
            pending_rotation: DashSet::new(),
        }
    }

    /// The active secret of `a` and `b`, in either order. Counts one use.
    ///
    /// A record at its usage limit is still returned; it is queued for
    /// rotation instead.
    pub fn get_shared_secret(&self, a: &str, b: &str) -> Result<Arc<SharedSecret>> {
        let pair = AgentPair::new(a, b)?;
        let record = self.current_secret(&pair)?;

        if record.record_use() >= record.max_usage && self.pending_rotation.insert(pair.clone()) {
            debug!(pair = %pair, secret_id = %record.secret_id, "Shared secret reached usage limit, rotation queued");
        }
        Ok(record)
    }

    /// The active record if it may still be used, without counting a use
    pub fn current_secret(&self, pair: &AgentPair) -> Result<Arc<SharedSecret>> {
        let record = self.peek(pair).ok_or_else(|| ExchangeError::NoSharedSecret(pair.to_string()))?;

        let now = self.ctx.now();
        if record.is_expired(now) || !self.is_reachable(&record, now) {
            return Err(ExchangeError::NoSharedSecret(pair.to_string()));
        }
        if self.is_remote(pair) && self.has_retired_source(&record, now) {
            self.queue_renegotiation(pair);
            return Err(ExchangeError::RenegotiationRequired(pair.to_string()));
        }
        Ok(record)
    }

    /// The active record without counting a use or checking expiry
    pub fn peek(&self, pair: &AgentPair) -> Option<Arc<SharedSecret>> {
        self.active.get(pair).map(|entry| Arc::clone(entry.value()))
    }

    /// False once both source keys are revoked
    fn is_reachable(&self, record: &SharedSecret, now: DateTime<Utc>) -> bool {
        let grace = self.ctx.config().rotation_grace_period;
        let revoked = |key_id: &str| {
            self.keys
                .key_info(key_id)
                .map_or(false, |info| info.effective_status(now, grace) == KeyStatus::Revoked)
        };
        !(revoked(record.source_keys.0.as_str()) && revoked(record.source_keys.1.as_str()))
    }

    /// One side's source key is revoked or expired
    fn has_retired_source(&self, record: &SharedSecret, now: DateTime<Utc>) -> bool {
        let grace = self.ctx.config().rotation_grace_period;
        let retired = |key_id: &str| {
            self.keys.key_info(key_id).map_or(true, |info| {
                matches!(
                    info.effective_status(now, grace),
                    KeyStatus::Revoked | KeyStatus::Expired
                )
            })
        };
        retired(record.source_keys.0.as_str()) || retired(record.source_keys.1.as_str())
    }

    /// True when one side's private key lives on another engine. Such a
    /// secret can only be replaced by a new exchange with that engine.
    pub fn is_remote(&self, pair: &AgentPair) -> bool {
        !(self.keys.is_local_agent(pair.first()) && self.keys.is_local_agent(pair.second()))
    }

    fn queue_renegotiation(&self, pair: &AgentPair) {
        if self.pending_rotation.insert(pair.clone()) {
            warn!(pair = %pair, "Shared secret with remote peer is stale, renegotiation required");
        }
    }

    /// Whether the active record was derived from both sides' current keys
    pub(crate) fn source_keys_current(&self, pair: &AgentPair) -> Result<bool> {
        let current = self
            .peek(pair)
            .ok_or_else(|| ExchangeError::NoSharedSecret(pair.to_string()))?;
        let first = self.keys.get_active_key(pair.first())?;
        let second = self.keys.get_active_key(pair.second())?;
        Ok(current.source_keys.0 == first.key_id && current.source_keys.1 == second.key_id)
    }

    /// Publish a record from a completed exchange.
    ///
    /// If the pair already holds a record with the same derived keys (both
    /// sides of an exchange ran on this engine) that record is kept.
    pub(crate) fn store_established(&self, record: SharedSecret) -> Arc<SharedSecret> {
        let pair = record.pair.clone();
        let record = Arc::new(record);

        let replaced = match self.active.entry(pair.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().shared_secret_hash().ct_eq(&record.shared_secret_hash()) {
                    return Arc::clone(entry.get());
                }
                Some(entry.insert(Arc::clone(&record)))
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&record));
                None
            }
        };

        if let Some(previous) = replaced {
            self.retire(previous);
        }
        self.pending_rotation.remove(&pair);
        record
    }

    fn retire(&self, record: Arc<SharedSecret>) {
        let retention = self.ctx.config().superseded_retention;
        let mut trail = self.superseded.entry(record.pair.clone()).or_default();
        trail.push_back(record);
        while trail.len() > retention {
            trail.pop_front();
        }
    }

    /// Queue every secret of `agent_id` for renegotiation.
    pub fn mark_agent_for_rotation(&self, agent_id: &str) -> Vec<AgentPair> {
        let pairs = self.pairs_for_agent(agent_id);
        for pair in &pairs {
            self.pending_rotation.insert(pair.clone());
        }
        if !pairs.is_empty() {
            debug!(agent_id, count = pairs.len(), "Shared secrets queued for rotation");
        }
        pairs
    }

    pub fn pairs_for_agent(&self, agent_id: &str) -> Vec<AgentPair> {
        let mut pairs: Vec<AgentPair> = self
            .active
            .iter()
            .filter(|entry| entry.key().contains(agent_id))
            .map(|entry| entry.key().clone())
            .collect();
        pairs.sort();
        pairs
    }

    /// Pairs queued for rotation or past their scheduled rotation time
    pub fn due_for_rotation(&self, now: DateTime<Utc>) -> Vec<AgentPair> {
        let mut due: Vec<AgentPair> = self
            .active
            .iter()
            .filter(|entry| {
                self.pending_rotation.contains(entry.key()) || now >= entry.value().rotation_scheduled
            })
            .map(|entry| entry.key().clone())
            .collect();
        due.sort();
        due
    }

    pub fn is_pending_rotation(&self, pair: &AgentPair) -> bool {
        self.pending_rotation.contains(pair)
    }

    /// Re-derive the pair's secret from both sides' current keys.
    ///
    /// At least one side must hold a newer key than the record was derived
    /// from. Pairs with a remote side are queued for renegotiation instead.
    pub async fn rotate_shared_secret(&self, pair: &AgentPair) -> Result<Arc<SharedSecret>> {
        let current = self
            .peek(pair)
            .ok_or_else(|| ExchangeError::NoSharedSecret(pair.to_string()))?;

        if self.is_remote(pair) {
            self.queue_renegotiation(pair);
            return Err(ExchangeError::RenegotiationRequired(pair.to_string()));
        }

        let first = self.keys.get_active_key(pair.first())?;
        let second = self.keys.get_active_key(pair.second())?;
        if current.source_keys.0 == first.key_id && current.source_keys.1 == second.key_id {
            return Err(ExchangeError::Validation(format!(
                "secret of {} is already derived from the current keys; rotate an agent key first",
                pair
            )));
        }
        let (local, peer) = (&first, &second);

        let raw = self.keys.diffie_hellman(&local.key_id, &peer.public_key).await?;
        let now = self.ctx.now();
        let next = SharedSecret::derive(
            Derivation {
                pair: pair.clone(),
                raw: &raw,
                source_keys: (first.key_id.clone(), second.key_id.clone()),
                algorithm: local.algorithm,
                established_by: None,
                generation: current.generation.saturating_add(1),
            },
            &self.ctx.policy(),
            now,
        )?;
        drop(raw);
        let next = Arc::new(next);

        // Publish only over the record this rotation started from
        let replaced = match self.active.entry(pair.clone()) {
            Entry::Occupied(mut entry) if entry.get().secret_id == current.secret_id => {
                entry.insert(Arc::clone(&next))
            }
            Entry::Occupied(entry) => return Ok(Arc::clone(entry.get())),
            Entry::Vacant(_) => return Err(ExchangeError::NoSharedSecret(pair.to_string())),
        };
        self.retire(replaced);
        self.pending_rotation.remove(pair);

        info!(
            pair = %pair,
            previous = %current.secret_id,
            secret_id = %next.secret_id,
            generation = next.generation,
            "Rotated shared secret"
        );
        self.ctx.emit(EngineEvent::SecretRotated {
            pair: pair.clone(),
            previous_secret_id: current.secret_id,
            secret_id: next.secret_id,
        });
        Ok(next)
    }

    /// Replaced records of `pair`, oldest first
    pub fn superseded(&self, pair: &AgentPair) -> Vec<Arc<SharedSecret>> {
        self.superseded
            .get(pair)
            .map(|trail| trail.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_pairs(&self) -> Vec<AgentPair> {
        let mut pairs: Vec<AgentPair> = self.active.iter().map(|entry| entry.key().clone()).collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
