//! RotationScheduler: periodic policy enforcement and emergency rotation.

use crate::cache::public_key_entry;
use crate::context::EngineContext;
use crate::error::{ExchangeError, Result};
use crate::keys::{KeyPairManager, KeyRotation, RotationOutcome};
use crate::protocol::{ExchangeProtocol, PruneReport};
use crate::store::{AgentPair, SharedSecret, SharedSecretStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one scheduler pass did
#[derive(Debug, Clone, Default)]
pub struct RotationReport {
    /// Rotating keys revoked after their grace window
    pub finalized: Vec<(String, String)>,
    pub expired: Vec<(String, String)>,
    pub warnings: usize,
    pub rotated_agents: Vec<String>,
    /// Agents still inside a previous rotation's grace window
    pub deferred_agents: Vec<String>,
    pub rotated_secrets: Vec<AgentPair>,
    /// Due secrets whose agents are all inside a grace window
    pub deferred_secrets: Vec<AgentPair>,
    /// Due secrets shared with a remote peer; need a new exchange
    pub renegotiations: Vec<AgentPair>,
    /// Rotations attempted but failed; retried on the next pass
    pub failures: Vec<String>,
    pub pruned: PruneReport,
}

/// Outcome of [`RotationScheduler::emergency_key_rotation`] across agents
#[derive(Debug, Clone, Default)]
pub struct EmergencyRotation {
    pub rotated: Vec<KeyRotation>,
    /// Secrets that could not be re-derived yet; still queued
    pub pending_secrets: Vec<AgentPair>,
    pub failed_agents: Vec<(String, String)>,
}

/// Result of [`RotationScheduler::renew_shared_secret`]
#[derive(Debug, Clone)]
pub enum SecretRenewal {
    Rotated {
        secret: Arc<SharedSecret>,
        /// Agent whose key was rotated to obtain fresh key material
        rotated_agent: Option<String>,
    },
    Deferred,
}

pub struct RotationScheduler {
    ctx: Arc<EngineContext>,
    keys: Arc<KeyPairManager>,
    store: Arc<SharedSecretStore>,
    protocol: Arc<ExchangeProtocol>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RotationScheduler {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        keys: Arc<KeyPairManager>,
        store: Arc<SharedSecretStore>,
        protocol: Arc<ExchangeProtocol>,
    ) -> Self {
        Self {
            ctx,
            keys,
            store,
            protocol,
            task: Mutex::new(None),
        }
    }

    /// Rotate one agent's key and reschedule the secrets derived from it.
    ///
    /// Dependent secrets are queued for the next pass; under `emergency`
    /// they are re-derived before this returns.
    pub async fn rotate_agent_keys(&self, agent_id: &str, emergency: bool) -> Result<RotationOutcome> {
        self.ctx.ensure_running()?;
        let outcome = self.keys.rotate_agent_keys(agent_id, emergency).await?;

        if let RotationOutcome::Rotated(rotation) = &outcome {
            for key_id in &rotation.revoked {
                self.ctx.cache.invalidate(&public_key_entry(key_id)).await;
            }
            self.store.mark_agent_for_rotation(agent_id);
            if emergency {
                self.rotate_secrets_of(agent_id).await;
            }
        }
        Ok(outcome)
    }

    /// Replace a pair's secret with one derived from new key material.
    ///
    /// When neither side's key changed since the record was derived, one
    /// local agent's key is rotated first. Returns `Deferred` if both are
    /// still inside a grace window.
    pub async fn renew_shared_secret(&self, pair: &AgentPair) -> Result<SecretRenewal> {
        self.ctx.ensure_running()?;
        let mut rotated_agent = None;
        if !self.store.is_remote(pair) && self.store.source_keys_current(pair)? {
            for agent_id in [pair.first(), pair.second()] {
                if let RotationOutcome::Rotated(_) = self.rotate_agent_keys(agent_id, false).await? {
                    rotated_agent = Some(agent_id.to_string());
                    break;
                }
            }
            if rotated_agent.is_none() {
                debug!(pair = %pair, "Secret renewal deferred, both keys in grace window");
                return Ok(SecretRenewal::Deferred);
            }
        }
        let secret = self.store.rotate_shared_secret(pair).await?;
        Ok(SecretRenewal::Rotated { secret, rotated_agent })
    }

    /// Re-derive every queued secret of `agent_id`; returns the pairs still queued.
    async fn rotate_secrets_of(&self, agent_id: &str) -> Vec<AgentPair> {
        let mut pending = Vec::new();
        for pair in self.store.pairs_for_agent(agent_id) {
            // Already re-derived while rotating the other side
            if !self.store.is_pending_rotation(&pair) {
                continue;
            }
            if let Err(e) = self.store.rotate_shared_secret(&pair).await {
                warn!(pair = %pair, error = %e, "Shared secret rotation failed, left queued");
                pending.push(pair);
            }
        }
        pending
    }

    /// Revoke and replace keys immediately, skipping grace windows.
    ///
    /// With no agent id every agent managed by this engine is rotated.
    pub async fn emergency_key_rotation(&self, agent_id: Option<&str>) -> Result<EmergencyRotation> {
        self.ctx.ensure_running()?;
        if !self.ctx.policy().emergency_rotation {
            return Err(ExchangeError::Validation(
                "emergency rotation is disabled by policy".to_string(),
            ));
        }

        let agents = match agent_id {
            Some(agent_id) => vec![agent_id.to_string()],
            None => self.keys.local_agents(),
        };
        warn!(agents = agents.len(), "Emergency key rotation");

        let mut report = EmergencyRotation::default();
        for agent in agents {
            let outcome = match self.keys.rotate_agent_keys(&agent, true).await {
                Ok(outcome) => outcome,
                Err(e) if agent_id.is_some() => return Err(e),
                Err(e) => {
                    warn!(agent_id = %agent, error = %e, "Emergency rotation failed");
                    report.failed_agents.push((agent, e.to_string()));
                    continue;
                }
            };
            if let RotationOutcome::Rotated(rotation) = outcome {
                for key_id in &rotation.revoked {
                    self.ctx.cache.invalidate(&public_key_entry(key_id)).await;
                }
                self.store.mark_agent_for_rotation(&agent);
                report.rotated.push(rotation);
            }
        }

        for rotation in &report.rotated {
            report.pending_secrets.extend(self.rotate_secrets_of(&rotation.agent_id).await);
        }
        report.pending_secrets.sort();
        report.pending_secrets.dedup();
        Ok(report)
    }

    /// One scheduler pass.
    pub async fn run_rotation_check(&self) -> Result<RotationReport> {
        self.ctx.ensure_running()?;
        let now = self.ctx.now();
        let policy = self.ctx.policy();
        let mut report = RotationReport::default();

        report.finalized = self.keys.finalize_rotations(now);
        for (_, key_id) in &report.finalized {
            self.ctx.cache.invalidate(&public_key_entry(key_id)).await;
        }
        report.expired = self.keys.expire_keys(now);

        let scan = self.keys.scan_for_rotation(now);
        report.warnings = scan.warnings.len();

        if policy.automatic_rotation {
            for agent_id in scan.due {
                match self.rotate_agent_keys(&agent_id, false).await {
                    Ok(RotationOutcome::Rotated(_)) => report.rotated_agents.push(agent_id),
                    Ok(RotationOutcome::Deferred { .. }) => report.deferred_agents.push(agent_id),
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Scheduled key rotation failed");
                        report.failures.push(format!("{}: {}", agent_id, e));
                    }
                }
            }

            for pair in self.store.due_for_rotation(now) {
                match self.renew_shared_secret(&pair).await {
                    Ok(SecretRenewal::Rotated { rotated_agent, .. }) => {
                        report.rotated_agents.extend(rotated_agent);
                        report.rotated_secrets.push(pair);
                    }
                    Ok(SecretRenewal::Deferred) => report.deferred_secrets.push(pair),
                    Err(ExchangeError::RenegotiationRequired(_)) => report.renegotiations.push(pair),
                    Err(e) => {
                        debug!(pair = %pair, error = %e, "Scheduled secret rotation failed");
                        report.failures.push(format!("{}: {}", pair, e));
                    }
                }
            }
        }

        report.pruned = self.protocol.prune(now);

        if !report.rotated_agents.is_empty() || !report.rotated_secrets.is_empty() || !report.finalized.is_empty() {
            info!(
                rotated_agents = report.rotated_agents.len(),
                rotated_secrets = report.rotated_secrets.len(),
                revoked = report.finalized.len(),
                expired = report.expired.len(),
                warnings = report.warnings,
                "Rotation check complete"
            );
        } else {
            debug!(warnings = report.warnings, expired = report.expired.len(), "Rotation check complete");
        }
        Ok(report)
    }

    /// Spawn the periodic task. Calling it again while it runs does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ctx.ensure_running()?;
        let mut task = self.task.lock().await;
        if task.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return Ok(());
        }

        let scheduler = Arc::clone(self);
        let shutdown = self.ctx.shutdown.clone();
        info!(tick = ?self.ctx.config().scheduler_tick(), "Starting rotation scheduler");

        *task = Some(tokio::spawn(async move {
            loop {
                // Re-read every pass so policy updates change the period
                let tick = scheduler.ctx.config().scheduler_tick();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
                if shutdown.is_cancelled() {
                    break;
                }

                match scheduler.run_rotation_check().await {
                    Ok(_) => {}
                    Err(ExchangeError::EngineShuttingDown) => break,
                    Err(e) => warn!(error = %e, "Rotation check failed"),
                }
            }
            debug!("Rotation scheduler stopped");
        }));
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Wait for the periodic task to exit. The shutdown token must be
    /// cancelled first.
    pub(crate) async fn join(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Rotation scheduler task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;
    use crate::keys::KeyStatus;
    use std::time::Duration;

    struct Fixture {
        ctx: Arc<EngineContext>,
        keys: Arc<KeyPairManager>,
        store: Arc<SharedSecretStore>,
        protocol: Arc<ExchangeProtocol>,
        scheduler: Arc<RotationScheduler>,
        clock: Arc<ManualClock>,
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let ctx = EngineContext::for_tests(config, clock.clone());
        let keys = Arc::new(KeyPairManager::new(ctx.clone()));
        let store = Arc::new(SharedSecretStore::new(ctx.clone(), keys.clone()));
        let protocol = Arc::new(ExchangeProtocol::new(ctx.clone(), keys.clone(), store.clone()));
        let scheduler = Arc::new(RotationScheduler::new(
            ctx.clone(),
            keys.clone(),
            store.clone(),
            protocol.clone(),
        ));
        Fixture { ctx, keys, store, protocol, scheduler, clock }
    }

    async fn exchange(f: &Fixture, from: &str, to: &str) {
        for agent in [from, to] {
            if f.keys.get_active_key(agent).is_err() {
                f.keys.generate_agent_key_pair(agent, None, None).await.unwrap();
            }
        }
        let request = f.protocol.initiate_key_exchange(from, to, vec![], None).await.unwrap();
        assert!(f.protocol.respond_to_key_exchange(&request, true).await.unwrap().agreed);
    }

    #[tokio::test]
    async fn test_rotation_queues_dependent_secrets() {
        let f = fixture(EngineConfig::default()).await;
        exchange(&f, "alice", "bob").await;
        exchange(&f, "alice", "carol").await;
        let before = f.store.get_shared_secret("alice", "bob").unwrap();

        f.scheduler.rotate_agent_keys("alice", false).await.unwrap();
        assert_eq!(f.store.due_for_rotation(f.clock.now()).len(), 2);
        // Nothing re-derived until the next pass
        assert_eq!(f.store.get_shared_secret("alice", "bob").unwrap().secret_id, before.secret_id);

        let report = f.scheduler.run_rotation_check().await.unwrap();
        assert_eq!(report.rotated_secrets.len(), 2);
        let after = f.store.get_shared_secret("bob", "alice").unwrap();
        assert_ne!(after.secret_id, before.secret_id);
        assert_ne!(after.shared_secret_hash(), before.shared_secret_hash());
        assert_eq!(after.source_keys.0, f.keys.get_active_key("alice").unwrap().key_id);
    }

    #[tokio::test]
    async fn test_pass_revokes_after_grace_and_warns_once() {
        let mut config = EngineConfig::default();
        config.policy.automatic_rotation = false;
        let f = fixture(config).await;
        let old = f.keys.generate_agent_key_pair("alice", None, None).await.unwrap();
        f.scheduler.rotate_agent_keys("alice", false).await.unwrap();

        let report = f.scheduler.run_rotation_check().await.unwrap();
        assert!(report.finalized.is_empty());

        f.clock.advance(Duration::from_secs(61));
        let report = f.scheduler.run_rotation_check().await.unwrap();
        assert_eq!(report.finalized, vec![("alice".to_string(), old.key_id.clone())]);
        assert_eq!(f.keys.key_info(&old.key_id).unwrap().status, KeyStatus::Revoked);

        // Inside the pre-rotation warning window of the new key
        f.clock.advance(Duration::from_secs(7 * 24 * 3600 - 1800));
        let report = f.scheduler.run_rotation_check().await.unwrap();
        assert_eq!(report.warnings, 1);
        assert!(report.rotated_agents.is_empty());
        let report = f.scheduler.run_rotation_check().await.unwrap();
        assert_eq!(report.warnings, 0);
    }

    #[tokio::test]
    async fn test_automatic_rotation_of_aged_keys() {
        let f = fixture(EngineConfig::default()).await;
        let old = f.keys.generate_agent_key_pair("alice", None, None).await.unwrap();

        f.clock.advance(Duration::from_secs(24 * 3600));
        let report = f.scheduler.run_rotation_check().await.unwrap();
        assert_eq!(report.rotated_agents, vec!["alice".to_string()]);
        assert_eq!(f.keys.key_info(&old.key_id).unwrap().status, KeyStatus::Rotating);
        assert_eq!(f.ctx.metrics.snapshot().key_rotations, 1);
    }

    #[tokio::test]
    async fn test_emergency_rotation_is_synchronous() {
        let f = fixture(EngineConfig::default()).await;
        exchange(&f, "alice", "bob").await;
        let before = f.store.get_shared_secret("alice", "bob").unwrap();
        let old = f.keys.get_active_key("alice").unwrap();

        let report = f.scheduler.emergency_key_rotation(Some("alice")).await.unwrap();
        assert_eq!(report.rotated.len(), 1);
        assert!(report.pending_secrets.is_empty());
        assert_eq!(f.keys.key_info(&old.key_id).unwrap().status, KeyStatus::Revoked);

        let after = f.store.get_shared_secret("alice", "bob").unwrap();
        assert_ne!(after.secret_id, before.secret_id);
        assert_ne!(after.shared_secret_hash(), before.shared_secret_hash());
        assert_ne!(
            after.derived_keys.mac_key.as_bytes(),
            before.derived_keys.mac_key.as_bytes()
        );
        assert!(!f.store.is_pending_rotation(&after.pair));
    }

    #[tokio::test]
    async fn test_emergency_all_agents_and_policy_switch() {
        let f = fixture(EngineConfig::default()).await;
        exchange(&f, "alice", "bob").await;
        let before = f.store.get_shared_secret("alice", "bob").unwrap();
        let report = f.scheduler.emergency_key_rotation(None).await.unwrap();
        assert_eq!(report.rotated.len(), 2);
        assert!(report.failed_agents.is_empty());
        assert!(report.pending_secrets.is_empty());

        // Derived once, from both replacement keys
        let after = f.store.get_shared_secret("alice", "bob").unwrap();
        assert_eq!(after.generation, 1);
        assert_ne!(after.shared_secret_hash(), before.shared_secret_hash());
        assert_eq!(
            after.source_keys,
            (
                f.keys.get_active_key("alice").unwrap().key_id,
                f.keys.get_active_key("bob").unwrap().key_id
            )
        );

        let g = fixture({
            let mut config = EngineConfig::default();
            config.policy.emergency_rotation = false;
            config
        })
        .await;
        assert!(matches!(
            g.scheduler.emergency_key_rotation(None).await,
            Err(ExchangeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_renewal_rotates_one_side_at_a_time() {
        let f = fixture(EngineConfig::default()).await;
        exchange(&f, "alice", "bob").await;
        let pair = AgentPair::new("alice", "bob").unwrap();
        let original = f.store.get_shared_secret("alice", "bob").unwrap();

        let first = match f.scheduler.renew_shared_secret(&pair).await.unwrap() {
            SecretRenewal::Rotated { secret, rotated_agent } => {
                assert_eq!(rotated_agent.as_deref(), Some("alice"));
                secret
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(first.shared_secret_hash(), original.shared_secret_hash());
        assert_ne!(
            first.derived_keys.encryption_key.as_bytes(),
            original.derived_keys.encryption_key.as_bytes()
        );

        // Alice is in her grace window, so bob's key supplies the fresh material
        let second = match f.scheduler.renew_shared_secret(&pair).await.unwrap() {
            SecretRenewal::Rotated { secret, rotated_agent } => {
                assert_eq!(rotated_agent.as_deref(), Some("bob"));
                secret
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(second.shared_secret_hash(), first.shared_secret_hash());
        assert_eq!(second.generation, 2);

        assert!(matches!(
            f.scheduler.renew_shared_secret(&pair).await.unwrap(),
            SecretRenewal::Deferred
        ));
        assert_eq!(f.store.peek(&pair).unwrap().secret_id, second.secret_id);

        f.clock.advance(Duration::from_secs(61));
        let report = f.scheduler.run_rotation_check().await.unwrap();
        assert_eq!(report.finalized.len(), 2);
        assert!(matches!(
            f.scheduler.renew_shared_secret(&pair).await.unwrap(),
            SecretRenewal::Rotated { .. }
        ));
    }

    #[tokio::test]
    async fn test_background_task_stops_on_shutdown() {
        let mut config = EngineConfig::default();
        config.policy.rotation_interval = Duration::from_millis(10);
        config.min_scheduler_tick = Duration::from_millis(5);
        let f = fixture(config).await;

        f.scheduler.start().await.unwrap();
        f.scheduler.start().await.unwrap();
        assert!(f.scheduler.is_running().await);
        tokio::time::sleep(Duration::from_millis(30)).await;

        f.ctx.shutdown.cancel();
        f.scheduler.join().await;
        assert!(!f.scheduler.is_running().await);
        assert!(matches!(f.scheduler.start().await, Err(ExchangeError::EngineShuttingDown)));
        assert!(matches!(
            f.scheduler.run_rotation_check().await,
            Err(ExchangeError::EngineShuttingDown)
        ));
    }
}
