//! KeyPairManager: per-agent key lifecycle.
//!
//! Every agent has at most one `Active` key. Rotation moves it to `Rotating`
//! for a grace window (so in-flight exchanges can finish) and the scheduler
//! later revokes it; emergency rotation revokes at once. Lookups never mutate:
//! a key past its expiry or grace window is reported by its effective status
//! until the scheduler records the transition.

use crate::clock;
use crate::context::EngineContext;
use crate::error::{ExchangeError, Result};
use crate::events::{EngineEvent, WarningReason};
use a2a_crypto::{AgentPublicKey, AgentSecretKey, SensitiveBytes32};
use a2a_vault::{HsmKeyHandle, HsmKeyRequest, HsmProvider, VaultError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Ecdh,
    Rsa,
    Kyber,
    Dilithium,
}

impl KeyAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ecdh => "ECDH",
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Kyber => "Kyber",
            KeyAlgorithm::Dilithium => "Dilithium",
        }
    }

    /// Post-quantum migration tag; the key material is classical
    pub fn is_placeholder(&self) -> bool {
        matches!(self, KeyAlgorithm::Kyber | KeyAlgorithm::Dilithium)
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ecdh" => Ok(KeyAlgorithm::Ecdh),
            "rsa" => Ok(KeyAlgorithm::Rsa),
            "kyber" => Ok(KeyAlgorithm::Kyber),
            "dilithium" => Ok(KeyAlgorithm::Dilithium),
            other => Err(ExchangeError::Validation(format!("unknown key algorithm: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Curve {
    X25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStatus {
    Active,
    Rotating,
    Revoked,
    Expired,
}

/// Where the private half lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOrigin {
    Software,
    Hsm(HsmKeyHandle),
    /// Public key of a remote agent; no private half here
    Peer,
}

/// Public view of a managed key. Never contains private material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPairInfo {
    pub key_id: String,
    pub agent_id: String,
    pub algorithm: KeyAlgorithm,
    pub curve: Option<Curve>,
    pub key_size: Option<u32>,
    pub public_key: AgentPublicKey,
    pub origin: KeyOrigin,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: KeyStatus,
    pub rotating_since: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub max_usage: u64,
}

impl KeyPairInfo {
    pub fn has_private_key(&self) -> bool {
        !matches!(self.origin, KeyOrigin::Peer)
    }

    /// Status with pending time-based transitions applied
    pub fn effective_status(&self, now: DateTime<Utc>, grace: Duration) -> KeyStatus {
        match self.status {
            KeyStatus::Active | KeyStatus::Rotating if now >= self.expires_at => KeyStatus::Expired,
            KeyStatus::Rotating if grace_elapsed(self, now, grace) => KeyStatus::Revoked,
            status => status,
        }
    }

    fn ensure_usable(&self, now: DateTime<Utc>, grace: Duration) -> Result<()> {
        match self.effective_status(now, grace) {
            KeyStatus::Active | KeyStatus::Rotating => Ok(()),
            KeyStatus::Revoked => Err(ExchangeError::KeyRevoked(self.key_id.clone())),
            KeyStatus::Expired => Err(ExchangeError::KeyExpired(self.key_id.clone())),
        }
    }
}

fn grace_elapsed(info: &KeyPairInfo, now: DateTime<Utc>, grace: Duration) -> bool {
    info.rotating_since
        .map_or(false, |since| now >= clock::after(since, grace))
}

enum KeyCustody {
    Software(AgentSecretKey),
    Hsm(HsmKeyHandle),
    Peer,
}

struct ManagedKey {
    info: KeyPairInfo,
    custody: KeyCustody,
    warned: bool,
}

/// Keys of one agent, oldest first
#[derive(Default)]
struct AgentKeys {
    keys: Vec<ManagedKey>,
}

impl AgentKeys {
    fn active(&self) -> Option<&ManagedKey> {
        self.keys.iter().rev().find(|k| k.info.status == KeyStatus::Active)
    }

    fn find_mut(&mut self, key_id: &str) -> Option<&mut ManagedKey> {
        self.keys.iter_mut().find(|k| k.info.key_id == key_id)
    }

    fn latest(&self) -> Option<&ManagedKey> {
        self.keys.last()
    }

    fn is_peer(&self) -> bool {
        self.keys.iter().any(|k| matches!(k.custody, KeyCustody::Peer))
    }

    /// A non-emergency rotation must wait for this key's grace window
    fn rotating_in_grace(&self, now: DateTime<Utc>, grace: Duration) -> Option<(String, DateTime<Utc>)> {
        self.keys
            .iter()
            .filter(|k| k.info.status == KeyStatus::Rotating && !grace_elapsed(&k.info, now, grace))
            .find_map(|k| k.info.rotating_since.map(|since| (k.info.key_id.clone(), clock::after(since, grace))))
    }
}

/// Result of a completed rotation
#[derive(Debug, Clone)]
pub struct KeyRotation {
    pub agent_id: String,
    pub previous: Option<KeyPairInfo>,
    pub current: KeyPairInfo,
    /// Keys revoked by this rotation (emergency only)
    pub revoked: Vec<String>,
    pub emergency: bool,
}

#[derive(Debug, Clone)]
pub enum RotationOutcome {
    Rotated(KeyRotation),
    /// The previous rotation is still inside its grace window
    Deferred {
        agent_id: String,
        rotating_key_id: String,
        grace_ends: DateTime<Utc>,
    },
}

/// Findings of one scan over all active keys
#[derive(Debug, Clone, Default)]
pub struct RotationScan {
    pub warnings: Vec<(String, String, WarningReason)>,
    /// Agents whose active key should be rotated
    pub due: Vec<String>,
}

fn validate_agent_id(agent_id: &str) -> Result<()> {
    if agent_id.trim().is_empty() {
        return Err(ExchangeError::Validation("agent id is empty".to_string()));
    }
    if agent_id.len() > 256 {
        return Err(ExchangeError::Validation("agent id exceeds 256 bytes".to_string()));
    }
    Ok(())
}

fn check_algorithm(algorithm: KeyAlgorithm, curve: Option<Curve>) -> Result<Curve> {
    match algorithm {
        KeyAlgorithm::Rsa => Err(ExchangeError::Validation(
            "RSA keys are not supported; use ECDH".to_string(),
        )),
        _ => Ok(curve.unwrap_or(Curve::X25519)),
    }
}

fn hsm_unavailable(err: VaultError) -> ExchangeError {
    match err {
        VaultError::HsmUnavailable(msg) => ExchangeError::HsmUnavailable(msg),
        other => ExchangeError::HsmUnavailable(other.to_string()),
    }
}

pub struct KeyPairManager {
    ctx: Arc<EngineContext>,
    agents: DashMap<String, AgentKeys>,
    /// key id -> agent id
    key_index: DashMap<String, String>,
}

impl KeyPairManager {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            agents: DashMap::new(),
            key_index: DashMap::new(),
        }
    }

    fn provider(&self) -> Result<Arc<dyn HsmProvider>> {
        self.ctx
            .hsm
            .clone()
            .ok_or_else(|| ExchangeError::HsmUnavailable("no HSM provider is configured".to_string()))
    }

    async fn create_key(
        &self,
        agent_id: &str,
        algorithm: KeyAlgorithm,
        curve: Option<Curve>,
        now: DateTime<Utc>,
    ) -> Result<ManagedKey> {
        let config = self.ctx.config();
        let curve = check_algorithm(algorithm, curve)?;
        let key_id = format!("key-{}", Uuid::new_v4().simple());

        let (public_key, custody, origin) = if config.hsm.delegates_generation() {
            let provider = self.provider()?;
            self.ctx.metrics.hsm_operations.inc();
            let request = HsmKeyRequest {
                agent_id: agent_id.to_string(),
                key_id: key_id.clone(),
                algorithm: algorithm.name().to_string(),
            };
            let generated = provider.generate_key_pair(&request).await.map_err(|e| {
                warn!(agent_id, provider = provider.name(), error = %e, "HSM key generation failed");
                hsm_unavailable(e)
            })?;
            (
                generated.public_key,
                KeyCustody::Hsm(generated.handle.clone()),
                KeyOrigin::Hsm(generated.handle),
            )
        } else {
            let secret = AgentSecretKey::generate();
            (secret.public_key(), KeyCustody::Software(secret), KeyOrigin::Software)
        };

        Ok(ManagedKey {
            info: KeyPairInfo {
                key_id,
                agent_id: agent_id.to_string(),
                algorithm,
                curve: Some(curve),
                key_size: Some(256),
                public_key,
                origin,
                created_at: now,
                expires_at: clock::after(now, config.policy.key_lifetime),
                status: KeyStatus::Active,
                rotating_since: None,
                usage_count: 0,
                max_usage: config.policy.max_key_usage,
            },
            custody,
            warned: false,
        })
    }

    /// Create the first active key pair of an agent.
    pub async fn generate_agent_key_pair(
        &self,
        agent_id: &str,
        algorithm: Option<KeyAlgorithm>,
        curve: Option<Curve>,
    ) -> Result<KeyPairInfo> {
        validate_agent_id(agent_id)?;
        let algorithm = algorithm.unwrap_or_else(|| self.ctx.policy().default_algorithm());
        check_algorithm(algorithm, curve)?;

        let now = self.ctx.now();
        let grace = self.ctx.config().rotation_grace_period;
        let has_live_key = |agent: &AgentKeys| -> bool {
            agent.is_peer()
                || agent
                    .active()
                    .map_or(false, |k| k.info.effective_status(now, grace) == KeyStatus::Active)
        };

        if self.agents.get(agent_id).map_or(false, |agent| has_live_key(&*agent)) {
            return Err(ExchangeError::Validation(format!(
                "agent {} already has an active key; rotate it instead",
                agent_id
            )));
        }

        let key = self.create_key(agent_id, algorithm, curve, now).await?;
        let info = key.info.clone();

        {
            let mut agent = self.agents.entry(agent_id.to_string()).or_default();
            if has_live_key(&*agent) {
                return Err(ExchangeError::Validation(format!(
                    "agent {} already has an active key; rotate it instead",
                    agent_id
                )));
            }
            // An active key that ran out its lifetime is recorded as expired
            for stale in agent.keys.iter_mut().filter(|k| k.info.status == KeyStatus::Active) {
                stale.info.status = KeyStatus::Expired;
            }
            agent.keys.push(key);
        }
        self.key_index.insert(info.key_id.clone(), agent_id.to_string());

        self.ctx.metrics.key_generations.inc();
        info!(
            agent_id,
            key_id = %info.key_id,
            algorithm = %info.algorithm,
            hsm = matches!(info.origin, KeyOrigin::Hsm(_)),
            "Generated agent key pair"
        );
        if info.algorithm.is_placeholder() {
            debug!(key_id = %info.key_id, "Post-quantum tag uses classical key material");
        }
        self.ctx.emit(EngineEvent::KeyGenerated {
            agent_id: agent_id.to_string(),
            key_id: info.key_id.clone(),
            algorithm: info.algorithm,
            hsm_backed: matches!(info.origin, KeyOrigin::Hsm(_)),
        });

        Ok(info)
    }

    /// Replace an agent's active key.
    ///
    /// Non-emergency: the previous key becomes `Rotating`; if an earlier
    /// rotation is still inside its grace window nothing happens. Emergency:
    /// every active or rotating key is revoked immediately.
    pub async fn rotate_agent_keys(&self, agent_id: &str, emergency: bool) -> Result<RotationOutcome> {
        let now = self.ctx.now();
        let config = self.ctx.config();
        let grace = config.rotation_grace_period;

        let (algorithm, curve, blocked) = {
            let agent = self
                .agents
                .get(agent_id)
                .ok_or_else(|| ExchangeError::KeyNotFound(agent_id.to_string()))?;
            if agent.is_peer() {
                return Err(ExchangeError::Validation(format!(
                    "agent {} is a remote peer; its keys rotate on its own engine",
                    agent_id
                )));
            }
            let latest = agent
                .latest()
                .ok_or_else(|| ExchangeError::KeyNotFound(agent_id.to_string()))?;
            let current = agent.active().unwrap_or(latest);
            (current.info.algorithm, current.info.curve, agent.rotating_in_grace(now, grace))
        };

        if !emergency {
            if let Some((rotating_key_id, grace_ends)) = blocked {
                debug!(agent_id, rotating_key_id = %rotating_key_id, "Rotation deferred until grace window ends");
                return Ok(RotationOutcome::Deferred {
                    agent_id: agent_id.to_string(),
                    rotating_key_id,
                    grace_ends,
                });
            }
        }

        let algorithm = if config.policy.quantum_safe_transition {
            config.policy.default_algorithm()
        } else {
            algorithm
        };
        let new_key = self.create_key(agent_id, algorithm, curve, now).await?;
        let current = new_key.info.clone();

        let (previous, revoked) = {
            let mut agent = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| ExchangeError::KeyNotFound(agent_id.to_string()))?;

            if !emergency {
                if let Some((rotating_key_id, grace_ends)) = agent.rotating_in_grace(now, grace) {
                    return Ok(RotationOutcome::Deferred {
                        agent_id: agent_id.to_string(),
                        rotating_key_id,
                        grace_ends,
                    });
                }
            }

            let mut previous = None;
            let mut revoked = Vec::new();
            for key in agent.keys.iter_mut() {
                match key.info.status {
                    KeyStatus::Active if emergency => {
                        key.info.status = KeyStatus::Revoked;
                        revoked.push(key.info.key_id.clone());
                        previous = Some(key.info.clone());
                    }
                    KeyStatus::Active => {
                        key.info.status = KeyStatus::Rotating;
                        key.info.rotating_since = Some(now);
                        previous = Some(key.info.clone());
                    }
                    KeyStatus::Rotating if emergency => {
                        key.info.status = KeyStatus::Revoked;
                        revoked.push(key.info.key_id.clone());
                    }
                    _ => {}
                }
            }
            if previous.is_none() {
                previous = agent.latest().map(|k| k.info.clone());
            }
            agent.keys.push(new_key);
            (previous, revoked)
        };
        self.key_index.insert(current.key_id.clone(), agent_id.to_string());

        self.ctx.metrics.key_rotations.inc();
        info!(
            agent_id,
            previous = previous.as_ref().map(|k| k.key_id.as_str()).unwrap_or("-"),
            key_id = %current.key_id,
            emergency,
            "Rotated agent keys"
        );
        self.ctx.emit(EngineEvent::KeyRotated {
            agent_id: agent_id.to_string(),
            previous_key_id: previous.as_ref().map(|k| k.key_id.clone()),
            key_id: current.key_id.clone(),
            emergency,
        });
        for key_id in &revoked {
            self.ctx.emit(EngineEvent::KeyRevoked {
                agent_id: agent_id.to_string(),
                key_id: key_id.clone(),
            });
        }

        Ok(RotationOutcome::Rotated(KeyRotation {
            agent_id: agent_id.to_string(),
            previous,
            current,
            revoked,
            emergency,
        }))
    }

    /// Revoke every active or rotating key of an agent.
    pub fn revoke_agent_keys(&self, agent_id: &str) -> Result<Vec<String>> {
        let revoked: Vec<String> = {
            let mut agent = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| ExchangeError::KeyNotFound(agent_id.to_string()))?;
            agent
                .keys
                .iter_mut()
                .filter(|k| matches!(k.info.status, KeyStatus::Active | KeyStatus::Rotating))
                .map(|k| {
                    k.info.status = KeyStatus::Revoked;
                    k.info.key_id.clone()
                })
                .collect()
        };

        for key_id in &revoked {
            warn!(agent_id, key_id = %key_id, "Revoked agent key");
            self.ctx.emit(EngineEvent::KeyRevoked {
                agent_id: agent_id.to_string(),
                key_id: key_id.clone(),
            });
        }
        Ok(revoked)
    }

    /// The agent's current key, if it is still usable.
    pub fn get_active_key(&self, agent_id: &str) -> Result<KeyPairInfo> {
        let now = self.ctx.now();
        let grace = self.ctx.config().rotation_grace_period;
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| ExchangeError::KeyNotFound(agent_id.to_string()))?;

        if let Some(active) = agent.active() {
            return match active.info.effective_status(now, grace) {
                KeyStatus::Expired => Err(ExchangeError::KeyExpired(active.info.key_id.clone())),
                _ => Ok(active.info.clone()),
            };
        }

        match agent.latest().map(|k| k.info.effective_status(now, grace)) {
            Some(KeyStatus::Expired) => Err(ExchangeError::KeyExpired(agent_id.to_string())),
            Some(KeyStatus::Revoked) | Some(KeyStatus::Rotating) => {
                Err(ExchangeError::KeyRevoked(agent_id.to_string()))
            }
            _ => Err(ExchangeError::KeyNotFound(agent_id.to_string())),
        }
    }

    /// Any known key by id, whatever its status.
    pub fn key_info(&self, key_id: &str) -> Result<KeyPairInfo> {
        let agent_id = self.agent_of(key_id)?;
        let agent = self
            .agents
            .get(&agent_id)
            .ok_or_else(|| ExchangeError::KeyNotFound(key_id.to_string()))?;
        agent
            .keys
            .iter()
            .find(|k| k.info.key_id == key_id)
            .map(|k| k.info.clone())
            .ok_or_else(|| ExchangeError::KeyNotFound(key_id.to_string()))
    }

    /// A key that may still sign and agree (active or inside its grace window).
    pub fn usable_key(&self, key_id: &str) -> Result<KeyPairInfo> {
        let info = self.key_info(key_id)?;
        info.ensure_usable(self.ctx.now(), self.ctx.config().rotation_grace_period)?;
        Ok(info)
    }

    pub fn key_history(&self, agent_id: &str) -> Vec<KeyPairInfo> {
        self.agents
            .get(agent_id)
            .map(|agent| agent.keys.iter().map(|k| k.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether this engine holds the agent's private keys
    pub fn is_local_agent(&self, agent_id: &str) -> bool {
        self.agents
            .get(agent_id)
            .map_or(false, |agent| !agent.keys.is_empty() && !agent.is_peer())
    }

    /// Agents whose keys are held by this engine
    pub fn local_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .agents
            .iter()
            .filter(|entry| !entry.value().is_peer())
            .map(|entry| entry.key().clone())
            .collect();
        agents.sort();
        agents
    }

    fn agent_of(&self, key_id: &str) -> Result<String> {
        self.key_index
            .get(key_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExchangeError::KeyNotFound(key_id.to_string()))
    }

    /// Count one use of a usable key and hand back what is needed to use it.
    fn take_for_use<T>(
        &self,
        key_id: &str,
        software: impl FnOnce(&AgentSecretKey) -> T,
    ) -> Result<std::result::Result<T, HsmKeyHandle>> {
        let now = self.ctx.now();
        let grace = self.ctx.config().rotation_grace_period;
        let agent_id = self.agent_of(key_id)?;
        let mut agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| ExchangeError::KeyNotFound(key_id.to_string()))?;
        let key = agent
            .find_mut(key_id)
            .ok_or_else(|| ExchangeError::KeyNotFound(key_id.to_string()))?;

        key.info.ensure_usable(now, grace)?;
        key.info.usage_count = (key.info.usage_count + 1).min(key.info.max_usage);

        match &key.custody {
            KeyCustody::Software(secret) => Ok(Ok(software(secret))),
            KeyCustody::Hsm(handle) => Ok(Err(handle.clone())),
            KeyCustody::Peer => Err(ExchangeError::Validation(format!(
                "key {} belongs to a remote peer; no private key here",
                key_id
            ))),
        }
    }

    /// Sign with the private half of `key_id`.
    pub async fn sign(&self, key_id: &str, message: &[u8]) -> Result<Vec<u8>> {
        let handle = match self.take_for_use(key_id, |secret| secret.sign(message).to_vec())? {
            Ok(signature) => return Ok(signature),
            Err(handle) => handle,
        };

        if !self.ctx.config().hsm.delegates_signing() {
            return Err(ExchangeError::HsmUnavailable(format!(
                "key {} is held by the HSM but HSM signing is disabled",
                key_id
            )));
        }
        let provider = self.provider()?;
        self.ctx.metrics.hsm_operations.inc();
        provider.sign(&handle, message).await.map_err(|e| {
            warn!(key_id, error = %e, "HSM signing failed");
            hsm_unavailable(e)
        })
    }

    /// X25519 agreement between `key_id` and a peer bundle.
    pub async fn diffie_hellman(&self, key_id: &str, peer: &AgentPublicKey) -> Result<SensitiveBytes32> {
        let handle = match self.take_for_use(key_id, |secret| secret.diffie_hellman(peer))? {
            Ok(raw) => return Ok(raw?),
            Err(handle) => handle,
        };

        if !self.ctx.config().hsm.enabled {
            return Err(ExchangeError::HsmUnavailable(format!(
                "key {} is held by the HSM but the HSM is disabled",
                key_id
            )));
        }
        let provider = self.provider()?;
        self.ctx.metrics.hsm_operations.inc();
        provider.diffie_hellman(&handle, peer).await.map_err(|e| {
            warn!(key_id, error = %e, "HSM key agreement failed");
            hsm_unavailable(e)
        })
    }

    /// Register the public key of an agent managed by another engine.
    ///
    /// A previously registered active key of that agent starts its grace window.
    pub fn import_peer_key(
        &self,
        agent_id: &str,
        key_id: &str,
        public_key: AgentPublicKey,
        algorithm: KeyAlgorithm,
        expires_at: DateTime<Utc>,
    ) -> Result<KeyPairInfo> {
        validate_agent_id(agent_id)?;
        let curve = check_algorithm(algorithm, None)?;
        let now = self.ctx.now();
        if expires_at <= now {
            return Err(ExchangeError::KeyExpired(key_id.to_string()));
        }
        if self.key_index.contains_key(key_id) {
            return Err(ExchangeError::Validation(format!("key {} is already known", key_id)));
        }

        let info = KeyPairInfo {
            key_id: key_id.to_string(),
            agent_id: agent_id.to_string(),
            algorithm,
            curve: Some(curve),
            key_size: Some(256),
            public_key,
            origin: KeyOrigin::Peer,
            created_at: now,
            expires_at,
            status: KeyStatus::Active,
            rotating_since: None,
            usage_count: 0,
            max_usage: u64::MAX,
        };

        {
            let mut agent = self.agents.entry(agent_id.to_string()).or_default();
            if !agent.keys.is_empty() && !agent.is_peer() {
                return Err(ExchangeError::Validation(format!(
                    "agent {} is managed by this engine",
                    agent_id
                )));
            }
            for previous in agent.keys.iter_mut().filter(|k| k.info.status == KeyStatus::Active) {
                previous.info.status = KeyStatus::Rotating;
                previous.info.rotating_since = Some(now);
            }
            agent.keys.push(ManagedKey {
                info: info.clone(),
                custody: KeyCustody::Peer,
                warned: false,
            });
        }
        self.key_index.insert(key_id.to_string(), agent_id.to_string());

        debug!(agent_id, key_id, "Imported peer key");
        Ok(info)
    }

    /// Adopt a key that was provisioned inside the HSM out of band.
    pub async fn adopt_hsm_key(
        &self,
        agent_id: &str,
        key_id: &str,
        public_key: AgentPublicKey,
        algorithm: KeyAlgorithm,
    ) -> Result<KeyPairInfo> {
        validate_agent_id(agent_id)?;
        let curve = check_algorithm(algorithm, None)?;
        let config = self.ctx.config();
        if !(config.hsm.enabled && config.hsm.key_storage) {
            return Err(ExchangeError::Validation(
                "adopting HSM keys requires HSM key storage".to_string(),
            ));
        }
        if self.get_active_key(agent_id).is_ok() {
            return Err(ExchangeError::Validation(format!(
                "agent {} already has an active key",
                agent_id
            )));
        }

        let provider = self.provider()?;
        self.ctx.metrics.hsm_operations.inc();
        let handle = provider.get_private_key_handle(key_id).await.map_err(hsm_unavailable)?;

        let now = self.ctx.now();
        let info = KeyPairInfo {
            key_id: key_id.to_string(),
            agent_id: agent_id.to_string(),
            algorithm,
            curve: Some(curve),
            key_size: Some(256),
            public_key,
            origin: KeyOrigin::Hsm(handle.clone()),
            created_at: now,
            expires_at: clock::after(now, config.policy.key_lifetime),
            status: KeyStatus::Active,
            rotating_since: None,
            usage_count: 0,
            max_usage: config.policy.max_key_usage,
        };

        {
            let mut agent = self.agents.entry(agent_id.to_string()).or_default();
            if agent.is_peer() || agent.active().is_some() {
                return Err(ExchangeError::Validation(format!(
                    "agent {} already has an active key",
                    agent_id
                )));
            }
            agent.keys.push(ManagedKey {
                info: info.clone(),
                custody: KeyCustody::Hsm(handle),
                warned: false,
            });
        }
        self.key_index.insert(key_id.to_string(), agent_id.to_string());

        info!(agent_id, key_id, "Adopted HSM-resident key");
        Ok(info)
    }

    /// Revoke rotating keys whose grace window has ended.
    pub(crate) fn finalize_rotations(&self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let grace = self.ctx.config().rotation_grace_period;
        let mut finalized = Vec::new();

        for mut agent in self.agents.iter_mut() {
            let agent_id = agent.key().clone();
            for key in agent.value_mut().keys.iter_mut() {
                if key.info.status == KeyStatus::Rotating && grace_elapsed(&key.info, now, grace) {
                    key.info.status = KeyStatus::Revoked;
                    finalized.push((agent_id.clone(), key.info.key_id.clone()));
                }
            }
        }

        for (agent_id, key_id) in &finalized {
            debug!(agent_id = %agent_id, key_id = %key_id, "Grace window ended, key revoked");
            self.ctx.emit(EngineEvent::KeyRevoked {
                agent_id: agent_id.clone(),
                key_id: key_id.clone(),
            });
        }
        finalized
    }

    /// Record expiry of keys past their lifetime.
    pub(crate) fn expire_keys(&self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let mut expired = Vec::new();
        for mut agent in self.agents.iter_mut() {
            let agent_id = agent.key().clone();
            for key in agent.value_mut().keys.iter_mut() {
                if matches!(key.info.status, KeyStatus::Active | KeyStatus::Rotating) && now >= key.info.expires_at {
                    key.info.status = KeyStatus::Expired;
                    expired.push((agent_id.clone(), key.info.key_id.clone()));
                }
            }
        }
        for (agent_id, key_id) in &expired {
            info!(agent_id = %agent_id, key_id = %key_id, "Agent key expired");
        }
        expired
    }

    /// Find active keys nearing their limits; warn once per key.
    pub(crate) fn scan_for_rotation(&self, now: DateTime<Utc>) -> RotationScan {
        let policy = self.ctx.policy();
        let mut scan = RotationScan::default();

        for mut agent in self.agents.iter_mut() {
            if agent.value().is_peer() {
                continue;
            }
            let agent_id = agent.key().clone();
            for key in agent.value_mut().keys.iter_mut() {
                if key.info.status != KeyStatus::Active || now >= key.info.expires_at {
                    continue;
                }

                let threshold = policy.usage_warning_threshold(key.info.max_usage);
                let usage_hit = key.info.usage_count >= threshold;
                let seconds_left = (key.info.expires_at - now).num_seconds();
                let expiry_hit = now >= clock::before(key.info.expires_at, policy.pre_rotation_warning);
                let age_due = now >= clock::after(key.info.created_at, policy.rotation_interval);

                if (usage_hit || expiry_hit) && !key.warned {
                    key.warned = true;
                    let reason = if usage_hit {
                        WarningReason::UsageThreshold {
                            usage: key.info.usage_count,
                            max_usage: key.info.max_usage,
                        }
                    } else {
                        WarningReason::ExpiryApproaching { seconds_left }
                    };
                    scan.warnings.push((agent_id.clone(), key.info.key_id.clone(), reason));
                }
                if usage_hit || expiry_hit || age_due {
                    scan.due.push(agent_id.clone());
                }
            }
        }

        for (agent_id, key_id, reason) in &scan.warnings {
            warn!(agent_id = %agent_id, key_id = %key_id, ?reason, "Key approaching rotation threshold");
            self.ctx.emit(EngineEvent::KeyRotationWarning {
                agent_id: agent_id.clone(),
                key_id: key_id.clone(),
                reason: *reason,
            });
        }
        scan.due.sort();
        scan.due.dedup();
        scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;

    fn manager() -> (KeyPairManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let ctx = EngineContext::for_tests(EngineConfig::default(), clock.clone());
        (KeyPairManager::new(ctx), clock)
    }

    #[tokio::test]
    async fn test_generate_sets_lifetime_and_limits() {
        let (keys, clock) = manager();
        let info = keys.generate_agent_key_pair("alice", None, None).await.unwrap();

        assert_eq!(info.status, KeyStatus::Active);
        assert_eq!(info.algorithm, KeyAlgorithm::Ecdh);
        assert_eq!(info.curve, Some(Curve::X25519));
        assert_eq!(info.max_usage, 10_000);
        assert_eq!(info.usage_count, 0);
        assert_eq!((info.expires_at - clock.now()).num_days(), 7);
        assert!(info.has_private_key());
    }

    #[tokio::test]
    async fn test_second_generate_rejected_and_rsa_unsupported() {
        let (keys, _) = manager();
        keys.generate_agent_key_pair("alice", None, None).await.unwrap();

        assert!(matches!(
            keys.generate_agent_key_pair("alice", None, None).await,
            Err(ExchangeError::Validation(_))
        ));
        assert!(matches!(
            keys.generate_agent_key_pair("bob", Some(KeyAlgorithm::Rsa), None).await,
            Err(ExchangeError::Validation(_))
        ));
        assert!(matches!(
            keys.generate_agent_key_pair("  ", None, None).await,
            Err(ExchangeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_requested_curve_is_kept_across_rotation() {
        let (keys, _) = manager();
        let info = keys
            .generate_agent_key_pair("alice", Some(KeyAlgorithm::Ecdh), Some(Curve::X25519))
            .await
            .unwrap();
        assert_eq!(info.curve, Some(Curve::X25519));

        let rotated = match keys.rotate_agent_keys("alice", true).await.unwrap() {
            RotationOutcome::Rotated(rotation) => rotation.current,
            other => panic!("expected rotation, got {:?}", other),
        };
        assert_eq!(rotated.curve, Some(Curve::X25519));
        assert!(keys.is_local_agent("alice"));
        assert!(!keys.is_local_agent("bob"));
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let (keys, clock) = manager();
        assert!(matches!(keys.get_active_key("nobody"), Err(ExchangeError::KeyNotFound(_))));

        let info = keys.generate_agent_key_pair("alice", None, None).await.unwrap();
        clock.advance(Duration::from_secs(8 * 24 * 3600));
        assert!(matches!(keys.get_active_key("alice"), Err(ExchangeError::KeyExpired(_))));
        assert!(matches!(keys.usable_key(&info.key_id), Err(ExchangeError::KeyExpired(_))));

        // Expired keys may be replaced by a fresh generation
        let fresh = keys.generate_agent_key_pair("alice", None, None).await.unwrap();
        assert_eq!(keys.key_info(&info.key_id).unwrap().status, KeyStatus::Expired);
        assert_eq!(keys.get_active_key("alice").unwrap().key_id, fresh.key_id);

        keys.revoke_agent_keys("alice").unwrap();
        assert!(matches!(keys.get_active_key("alice"), Err(ExchangeError::KeyRevoked(_))));
    }

    #[tokio::test]
    async fn test_rotation_grace_then_revoked() {
        let (keys, clock) = manager();
        let old = keys.generate_agent_key_pair("alice", None, None).await.unwrap();

        let rotation = match keys.rotate_agent_keys("alice", false).await.unwrap() {
            RotationOutcome::Rotated(rotation) => rotation,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(rotation.current.usage_count, 0);
        assert_eq!(keys.key_info(&old.key_id).unwrap().status, KeyStatus::Rotating);
        assert!(keys.usable_key(&old.key_id).is_ok());

        // Still inside the grace window: second rotation is a no-op
        assert!(matches!(
            keys.rotate_agent_keys("alice", false).await.unwrap(),
            RotationOutcome::Deferred { .. }
        ));

        clock.advance(Duration::from_secs(61));
        assert!(matches!(keys.usable_key(&old.key_id), Err(ExchangeError::KeyRevoked(_))));
        let finalized = keys.finalize_rotations(clock.now());
        assert_eq!(finalized, vec![("alice".to_string(), old.key_id.clone())]);
        assert_eq!(keys.key_info(&old.key_id).unwrap().status, KeyStatus::Revoked);
    }

    #[tokio::test]
    async fn test_emergency_rotation_wins() {
        let (keys, _) = manager();
        let first = keys.generate_agent_key_pair("alice", None, None).await.unwrap();
        keys.rotate_agent_keys("alice", false).await.unwrap();
        let second = keys.get_active_key("alice").unwrap();

        let rotation = match keys.rotate_agent_keys("alice", true).await.unwrap() {
            RotationOutcome::Rotated(rotation) => rotation,
            other => panic!("unexpected {:?}", other),
        };
        assert!(rotation.revoked.contains(&first.key_id));
        assert!(rotation.revoked.contains(&second.key_id));
        assert_eq!(keys.key_info(&second.key_id).unwrap().status, KeyStatus::Revoked);
        assert_eq!(keys.get_active_key("alice").unwrap().key_id, rotation.current.key_id);
    }

    #[tokio::test]
    async fn test_usage_counted_and_capped() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut config = EngineConfig::default();
        config.policy.max_key_usage = 3;
        let keys = KeyPairManager::new(EngineContext::for_tests(config, clock.clone()));

        let info = keys.generate_agent_key_pair("alice", None, None).await.unwrap();
        for _ in 0..5 {
            let signature = keys.sign(&info.key_id, b"payload").await.unwrap();
            assert!(info.public_key.verify(b"payload", &signature).is_ok());
        }
        assert_eq!(keys.key_info(&info.key_id).unwrap().usage_count, 3);

        let scan = keys.scan_for_rotation(clock.now());
        assert_eq!(scan.due, vec!["alice".to_string()]);
        assert_eq!(scan.warnings.len(), 1);

        // Warned once per key
        let scan = keys.scan_for_rotation(clock.now());
        assert!(scan.warnings.is_empty());
        assert_eq!(scan.due.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_keys_are_public_only() {
        let (keys, clock) = manager();
        let remote = AgentSecretKey::generate();
        let expires = clock.now() + chrono::Duration::hours(1);
        let info = keys
            .import_peer_key("carol", "carol-key-1", remote.public_key(), KeyAlgorithm::Ecdh, expires)
            .unwrap();
        assert!(!info.has_private_key());

        assert!(matches!(keys.sign("carol-key-1", b"x").await, Err(ExchangeError::Validation(_))));
        assert!(matches!(
            keys.rotate_agent_keys("carol", false).await,
            Err(ExchangeError::Validation(_))
        ));
        assert!(keys.local_agents().is_empty());

        let local = keys.generate_agent_key_pair("dave", None, None).await.unwrap();
        let ours = keys.diffie_hellman(&local.key_id, &info.public_key).await.unwrap();
        let theirs = remote.diffie_hellman(&local.public_key).unwrap();
        assert_eq!(ours.as_bytes(), theirs.as_bytes());
    }

    #[tokio::test]
    async fn test_missing_provider_fails_closed() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut config = EngineConfig::default();
        config.hsm.enabled = true;
        config.hsm.provider = "pkcs11".to_string();
        config.hsm.key_generation = true;
        config.hsm.key_storage = true;
        let keys = KeyPairManager::new(EngineContext::for_tests(config, clock));

        assert!(matches!(
            keys.generate_agent_key_pair("alice", None, None).await,
            Err(ExchangeError::HsmUnavailable(_))
        ));
        assert!(keys.key_history("alice").is_empty());
    }
}
