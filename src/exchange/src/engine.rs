//! The key exchange engine: one handle over every component.

use crate::cache::{public_key_entry, LookupCache, MemoryCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, KeyRotationPolicy, PolicyUpdate};
use crate::context::EngineContext;
use crate::error::{ExchangeError, Result};
use crate::events::{EventEnvelope, EventKind, SubscriptionId};
use crate::keys::{Curve, KeyAlgorithm, KeyPairInfo, KeyPairManager, RotationOutcome};
use crate::metrics::{ExchangeMetrics, MetricsSnapshot};
use crate::protocol::{ExchangeProtocol, ExchangeState, KeyExchangeRequest, KeyExchangeResponse};
use crate::rotation::{EmergencyRotation, RotationReport, RotationScheduler, SecretRenewal};
use crate::store::{AgentPair, SharedSecret, SharedSecretInfo, SharedSecretStore};
use crate::trust::{CapabilityCertificate, TrustedCaSet};
use a2a_crypto::{AgentPublicKey, SensitiveBytes32, SensitiveVec};
use a2a_vault::{DistributedKeyShare, HsmConfig, HsmConfigUpdate, HsmProvider, ThresholdSecretSharing};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Assembles a [`KeyExchangeEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    hsm: Option<Arc<dyn HsmProvider>>,
    cache: Option<Arc<dyn LookupCache>>,
    trusted: Arc<TrustedCaSet>,
    share_key: Option<SensitiveBytes32>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            hsm: None,
            cache: None,
            trusted: Arc::new(TrustedCaSet::new()),
            share_key: None,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn hsm_provider(mut self, provider: Arc<dyn HsmProvider>) -> Self {
        self.hsm = Some(provider);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn LookupCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn trusted_issuers(mut self, trusted: Arc<TrustedCaSet>) -> Self {
        self.trusted = trusted;
        self
    }

    /// Key that seals threshold shares; a random one is generated otherwise
    pub fn share_key(mut self, key: SensitiveBytes32) -> Self {
        self.share_key = Some(key);
        self
    }

    pub fn build(self) -> Result<KeyExchangeEngine> {
        self.config.validate()?;
        if let Some(provider) = &self.hsm {
            check_provider_name(&self.config.hsm, provider.as_ref())?;
        }

        let metrics = ExchangeMetrics::new()?;
        let cache: Arc<dyn LookupCache> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(MemoryCache::new(self.config.cache_capacity)),
        };
        let sharing = match self.share_key {
            Some(key) => ThresholdSecretSharing::with_system_key(key),
            None => ThresholdSecretSharing::new(),
        };

        let ctx = Arc::new(EngineContext::new(
            self.config,
            self.clock,
            metrics,
            cache,
            self.trusted,
            self.hsm,
        ));
        let keys = Arc::new(KeyPairManager::new(ctx.clone()));
        let store = Arc::new(SharedSecretStore::new(ctx.clone(), keys.clone()));
        let protocol = Arc::new(ExchangeProtocol::new(ctx.clone(), keys.clone(), store.clone()));
        let scheduler = Arc::new(RotationScheduler::new(
            ctx.clone(),
            keys.clone(),
            store.clone(),
            protocol.clone(),
        ));

        Ok(KeyExchangeEngine {
            ctx,
            keys,
            store,
            protocol,
            scheduler,
            sharing,
        })
    }
}

fn check_provider_name(hsm: &HsmConfig, provider: &dyn HsmProvider) -> Result<()> {
    if hsm.enabled && provider.name() != hsm.provider {
        return Err(ExchangeError::Validation(format!(
            "HSM provider {} does not match configured provider {}",
            provider.name(),
            hsm.provider
        )));
    }
    Ok(())
}

/// Agent-to-agent key exchange engine
pub struct KeyExchangeEngine {
    ctx: Arc<EngineContext>,
    keys: Arc<KeyPairManager>,
    store: Arc<SharedSecretStore>,
    protocol: Arc<ExchangeProtocol>,
    scheduler: Arc<RotationScheduler>,
    sharing: ThresholdSecretSharing,
}

impl KeyExchangeEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    // Keys

    pub async fn generate_agent_key_pair(
        &self,
        agent_id: &str,
        algorithm: Option<KeyAlgorithm>,
        curve: Option<Curve>,
    ) -> Result<KeyPairInfo> {
        self.ctx.ensure_running()?;
        self.keys.generate_agent_key_pair(agent_id, algorithm, curve).await
    }

    pub async fn rotate_agent_keys(&self, agent_id: &str, emergency: bool) -> Result<RotationOutcome> {
        self.scheduler.rotate_agent_keys(agent_id, emergency).await
    }

    pub async fn emergency_key_rotation(&self, agent_id: Option<&str>) -> Result<EmergencyRotation> {
        self.scheduler.emergency_key_rotation(agent_id).await
    }

    pub async fn revoke_agent_keys(&self, agent_id: &str) -> Result<Vec<String>> {
        self.ctx.ensure_running()?;
        let revoked = self.keys.revoke_agent_keys(agent_id)?;
        for key_id in &revoked {
            self.ctx.cache.invalidate(&public_key_entry(key_id)).await;
        }
        Ok(revoked)
    }

    pub fn get_active_key(&self, agent_id: &str) -> Result<KeyPairInfo> {
        self.keys.get_active_key(agent_id)
    }

    pub fn key_info(&self, key_id: &str) -> Result<KeyPairInfo> {
        self.keys.key_info(key_id)
    }

    pub fn key_history(&self, agent_id: &str) -> Vec<KeyPairInfo> {
        self.keys.key_history(agent_id)
    }

    /// Public key bundle of a key that has not been revoked.
    ///
    /// Served from the lookup cache when possible; entries never outlive the
    /// key and are dropped when it is revoked.
    pub async fn public_key(&self, key_id: &str) -> Result<AgentPublicKey> {
        let entry = public_key_entry(key_id);
        if let Some(bytes) = self.ctx.cache.get(&entry).await {
            if let Ok(public_key) = AgentPublicKey::from_bytes(&bytes) {
                return Ok(public_key);
            }
            self.ctx.cache.invalidate(&entry).await;
        }

        let info = self.keys.usable_key(key_id)?;
        let remaining = (info.expires_at - self.ctx.now()).to_std().unwrap_or(Duration::ZERO);
        let ttl = self.ctx.config().cache_ttl.min(remaining);
        if !ttl.is_zero() {
            self.ctx.cache.put(&entry, info.public_key.to_bytes().to_vec(), ttl).await;
        }
        Ok(info.public_key)
    }

    /// Register a remote agent's public key for exchanges with it.
    pub fn import_peer_key(
        &self,
        agent_id: &str,
        key_id: &str,
        public_key: AgentPublicKey,
        algorithm: KeyAlgorithm,
        expires_at: DateTime<Utc>,
    ) -> Result<KeyPairInfo> {
        self.ctx.ensure_running()?;
        self.keys
            .import_peer_key(agent_id, key_id, public_key, algorithm, expires_at)
    }

    pub async fn adopt_hsm_key(
        &self,
        agent_id: &str,
        key_id: &str,
        public_key: AgentPublicKey,
        algorithm: KeyAlgorithm,
    ) -> Result<KeyPairInfo> {
        self.ctx.ensure_running()?;
        self.keys.adopt_hsm_key(agent_id, key_id, public_key, algorithm).await
    }

    // Exchange

    pub async fn initiate_key_exchange(
        &self,
        from: &str,
        to: &str,
        capabilities: Vec<String>,
    ) -> Result<KeyExchangeRequest> {
        self.protocol.initiate_key_exchange(from, to, capabilities, None).await
    }

    /// Initiate with a capability certificate backing `capabilities`.
    pub async fn initiate_certified_exchange(
        &self,
        from: &str,
        to: &str,
        capabilities: Vec<String>,
        certificate: CapabilityCertificate,
    ) -> Result<KeyExchangeRequest> {
        self.protocol
            .initiate_key_exchange(from, to, capabilities, Some(certificate))
            .await
    }

    pub async fn respond_to_key_exchange(
        &self,
        request: &KeyExchangeRequest,
        accept: bool,
    ) -> Result<KeyExchangeResponse> {
        self.protocol.respond_to_key_exchange(request, accept).await
    }

    pub async fn confirm_key_exchange(&self, response: &KeyExchangeResponse) -> Result<Arc<SharedSecret>> {
        self.protocol.confirm_key_exchange(response).await
    }

    pub fn exchange_state(&self, request_id: Uuid) -> Option<ExchangeState> {
        self.protocol.exchange_state(request_id)
    }

    pub fn pending_requests(&self) -> Vec<KeyExchangeRequest> {
        self.protocol.pending_requests()
    }

    // Shared secrets

    pub fn get_shared_secret(&self, a: &str, b: &str) -> Result<Arc<SharedSecret>> {
        self.store.get_shared_secret(a, b)
    }

    /// Summary of the active secret without counting a use
    pub fn shared_secret_info(&self, a: &str, b: &str) -> Result<SharedSecretInfo> {
        let pair = AgentPair::new(a, b)?;
        self.store
            .peek(&pair)
            .map(|record| record.info())
            .ok_or_else(|| ExchangeError::NoSharedSecret(pair.to_string()))
    }

    /// Replace the pair's secret with one derived from fresh keys.
    ///
    /// Rotates one local agent's key when neither changed since the last
    /// derivation. A pair with a remote side must be renegotiated.
    pub async fn rotate_shared_secret(&self, a: &str, b: &str) -> Result<Arc<SharedSecret>> {
        self.ctx.ensure_running()?;
        let pair = AgentPair::new(a, b)?;
        match self.scheduler.renew_shared_secret(&pair).await? {
            SecretRenewal::Rotated { secret, .. } => Ok(secret),
            SecretRenewal::Deferred => Err(ExchangeError::Validation(format!(
                "keys of {} are inside a rotation grace window",
                pair
            ))),
        }
    }

    /// Replaced records of the pair, oldest first
    pub fn superseded_secrets(&self, a: &str, b: &str) -> Result<Vec<SharedSecretInfo>> {
        let pair = AgentPair::new(a, b)?;
        Ok(self.store.superseded(&pair).iter().map(|record| record.info()).collect())
    }

    pub fn shared_secret_pairs(&self) -> Vec<AgentPair> {
        self.store.active_pairs()
    }

    /// Split the pair's encryption key across `total` custodians.
    pub fn escrow_shared_secret(
        &self,
        a: &str,
        b: &str,
        threshold: usize,
        total: usize,
    ) -> Result<Vec<DistributedKeyShare>> {
        let pair = AgentPair::new(a, b)?;
        let record = self.store.current_secret(&pair)?;

        let shares = self.sharing.generate_distributed_key_shares(
            record.derived_keys.encryption_key.as_bytes(),
            threshold,
            total,
        )?;
        info!(pair = %pair, secret_id = %record.secret_id, threshold, total, "Escrowed shared secret");
        Ok(shares)
    }

    // Threshold sharing

    pub fn generate_distributed_key_shares(
        &self,
        secret: &[u8],
        threshold: usize,
        total: usize,
    ) -> Result<Vec<DistributedKeyShare>> {
        Ok(self.sharing.generate_distributed_key_shares(secret, threshold, total)?)
    }

    pub fn reconstruct_secret_from_shares(&self, shares: &[DistributedKeyShare]) -> Result<SensitiveVec> {
        Ok(self.sharing.reconstruct_secret_from_shares(shares)?)
    }

    /// Check one share against its commitment without reconstructing.
    pub fn verify_share(&self, share: &DistributedKeyShare) -> Result<()> {
        self.sharing.verify_share(share)?;
        Ok(())
    }

    // Configuration

    pub fn config(&self) -> EngineConfig {
        self.ctx.config()
    }

    pub fn update_policy(&self, update: &PolicyUpdate) -> Result<KeyRotationPolicy> {
        let config = self.ctx.update_config(|current| {
            Ok(EngineConfig {
                policy: current.policy.merged(update)?,
                ..current.clone()
            })
        })?;
        info!(policy = ?config.policy, "Rotation policy updated");
        Ok(config.policy)
    }

    pub fn update_hsm_config(&self, update: &HsmConfigUpdate) -> Result<HsmConfig> {
        let config = self.ctx.update_config(|current| {
            let hsm = current.hsm.merged(update)?;
            if let Some(provider) = &self.ctx.hsm {
                check_provider_name(&hsm, provider.as_ref())?;
            }
            Ok(EngineConfig {
                hsm,
                ..current.clone()
            })
        })?;
        info!(
            enabled = config.hsm.enabled,
            provider = %config.hsm.provider,
            key_generation = config.hsm.key_generation,
            signing = config.hsm.signing,
            "HSM configuration updated"
        );
        Ok(config.hsm)
    }

    pub fn trusted_issuers(&self) -> &Arc<TrustedCaSet> {
        &self.ctx.trusted
    }

    // Events and metrics

    pub fn subscribe<F>(&self, kind: EventKind, observer: F) -> SubscriptionId
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        self.ctx.events.subscribe(kind, observer)
    }

    pub fn subscribe_all<F>(&self, observer: F) -> Vec<SubscriptionId>
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        self.ctx.events.subscribe_all(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.ctx.events.unsubscribe(id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Counters in Prometheus text format
    pub fn encode_metrics(&self) -> Result<String> {
        self.ctx.metrics.encode_text()
    }

    // Lifecycle

    pub async fn start_rotation_scheduler(&self) -> Result<()> {
        self.scheduler.start().await
    }

    pub async fn run_rotation_check(&self) -> Result<RotationReport> {
        self.scheduler.run_rotation_check().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    /// Stop the scheduler and refuse new work. Safe to call twice.
    pub async fn shutdown(&self) {
        if !self.ctx.shutdown.is_cancelled() {
            info!("Shutting down key exchange engine");
            self.ctx.shutdown.cancel();
        }
        self.scheduler.join().await;
        debug!("Key exchange engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn engine() -> (KeyExchangeEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = KeyExchangeEngine::builder().clock(clock.clone()).build().unwrap();
        engine.generate_agent_key_pair("alice", None, None).await.unwrap();
        engine.generate_agent_key_pair("bob", None, None).await.unwrap();
        (engine, clock)
    }

    #[tokio::test]
    async fn test_public_key_lookup_is_cached_until_revoked() {
        let (engine, _) = engine().await;
        let alice = engine.get_active_key("alice").unwrap();

        assert_eq!(engine.public_key(&alice.key_id).await.unwrap(), alice.public_key);
        assert_eq!(engine.public_key(&alice.key_id).await.unwrap(), alice.public_key);

        engine.revoke_agent_keys("alice").await.unwrap();
        assert!(matches!(
            engine.public_key(&alice.key_id).await,
            Err(ExchangeError::KeyRevoked(_))
        ));
    }

    #[tokio::test]
    async fn test_policy_update_is_validated_and_not_retroactive() {
        let (engine, _) = engine().await;
        let before = engine.get_active_key("alice").unwrap();

        assert!(matches!(
            engine.update_policy(&PolicyUpdate { max_key_usage: Some(0), ..Default::default() }),
            Err(ExchangeError::Validation(_))
        ));
        assert_eq!(engine.config().policy.max_key_usage, 10_000);

        let policy = engine
            .update_policy(&PolicyUpdate { max_key_usage: Some(50), ..Default::default() })
            .unwrap();
        assert_eq!(policy.max_key_usage, 50);
        assert_eq!(engine.key_info(&before.key_id).unwrap().max_usage, 10_000);

        engine.generate_agent_key_pair("carol", None, None).await.unwrap();
        assert_eq!(engine.get_active_key("carol").unwrap().max_usage, 50);
    }

    #[tokio::test]
    async fn test_quantum_safe_switch_changes_default_tag() {
        let (engine, _) = engine().await;
        engine
            .update_policy(&PolicyUpdate { quantum_safe_transition: Some(true), ..Default::default() })
            .unwrap();
        let carol = engine.generate_agent_key_pair("carol", None, None).await.unwrap();
        assert_eq!(carol.algorithm, KeyAlgorithm::Kyber);
        assert!(carol.algorithm.is_placeholder());

        match engine.rotate_agent_keys("alice", false).await.unwrap() {
            RotationOutcome::Rotated(rotation) => assert_eq!(rotation.current.algorithm, KeyAlgorithm::Kyber),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_follow_exchange() {
        let (engine, _) = engine().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        engine.subscribe(EventKind::ExchangeEstablished, move |envelope| {
            assert_eq!(envelope.event.kind(), EventKind::ExchangeEstablished);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let request = engine.initiate_key_exchange("alice", "bob", vec![]).await.unwrap();
        engine.respond_to_key_exchange(&request, true).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let text = engine.encode_metrics().unwrap();
        assert!(text.contains("a2a_keyx_key_exchanges_total 1"));
        assert!(text.contains("a2a_keyx_key_generations_total 2"));
    }

    #[tokio::test]
    async fn test_escrow_round_trip() {
        let (engine, _) = engine().await;
        let request = engine.initiate_key_exchange("alice", "bob", vec![]).await.unwrap();
        engine.respond_to_key_exchange(&request, true).await.unwrap();

        let shares = engine.escrow_shared_secret("bob", "alice", 2, 3).unwrap();
        assert_eq!(shares.len(), 3);
        for share in &shares {
            assert!(engine.verify_share(share).is_ok());
        }
        let recovered = engine.reconstruct_secret_from_shares(&shares[1..]).unwrap();
        let record = engine.get_shared_secret("alice", "bob").unwrap();
        assert_eq!(recovered.as_bytes(), record.derived_keys.encryption_key.as_bytes());

        assert!(matches!(
            engine.escrow_shared_secret("alice", "carol", 2, 3),
            Err(ExchangeError::NoSharedSecret(_))
        ));
    }

    #[tokio::test]
    async fn test_escrow_refuses_unreachable_secret() {
        let (engine, _) = engine().await;
        let request = engine.initiate_key_exchange("alice", "bob", vec![]).await.unwrap();
        engine.respond_to_key_exchange(&request, true).await.unwrap();

        let used = engine.shared_secret_info("alice", "bob").unwrap().usage_count;
        engine.escrow_shared_secret("alice", "bob", 2, 3).unwrap();
        assert_eq!(engine.shared_secret_info("alice", "bob").unwrap().usage_count, used);

        engine.revoke_agent_keys("alice").await.unwrap();
        engine.revoke_agent_keys("bob").await.unwrap();
        assert!(matches!(
            engine.escrow_shared_secret("alice", "bob", 2, 3),
            Err(ExchangeError::NoSharedSecret(_))
        ));
        assert!(matches!(
            engine.get_shared_secret("alice", "bob"),
            Err(ExchangeError::NoSharedSecret(_))
        ));
    }
}
