//! Key exchange daemon wrapping one engine

use a2a_exchange::{EngineEvent, EventEnvelope, KeyExchangeEngine, MetricsSnapshot};
use a2a_vault::DistributedKeyShare;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;

/// Daemon owning a key exchange engine
pub struct KeyDaemon {
    config: NodeConfig,
    engine: Arc<KeyExchangeEngine>,
}

/// What `demo` did, for printing
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub initiator: String,
    pub responder: String,
    pub secret_hash: String,
    pub rotated_secret_hash: String,
    pub escrow_threshold: usize,
    pub escrow_total: usize,
    pub escrow_recovered: bool,
}

impl KeyDaemon {
    /// Build the engine from configuration
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = KeyExchangeEngine::builder()
            .config(config.engine_config())
            .trusted_issuers(Arc::new(config.trusted_issuers()?));
        if let Some(share_key) = config.share_key()? {
            builder = builder.share_key(share_key);
        }
        let engine = builder.build().context("Failed to build key exchange engine")?;

        if config.hsm.enabled {
            warn!(
                provider = %config.hsm.provider,
                "HSM routing is enabled but no provider is linked into this binary; HSM-routed operations will fail"
            );
        }
        info!(
            issuers = engine.trusted_issuers().len(),
            require_certificates = config.exchange.require_certificates,
            "Key exchange engine initialized"
        );

        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    pub fn engine(&self) -> &Arc<KeyExchangeEngine> {
        &self.engine
    }

    /// Generate keys for the configured agents
    pub async fn provision_agents(&self) -> Result<usize> {
        for agent in &self.config.node.agents {
            let info = self
                .engine
                .generate_agent_key_pair(agent, None, None)
                .await
                .with_context(|| format!("Failed to generate key pair for {}", agent))?;
            info!(agent_id = %agent, key_id = %info.key_id, algorithm = %info.algorithm, "Provisioned agent");
        }
        Ok(self.config.node.agents.len())
    }

    /// Run the scheduler until `shutdown` completes, then stop the engine
    pub async fn run<F>(&self, shutdown: F) -> Result<MetricsSnapshot>
    where
        F: Future<Output = ()>,
    {
        if self.config.node.log_events {
            self.engine.subscribe_all(log_event);
        }
        self.provision_agents().await?;
        self.engine
            .start_rotation_scheduler()
            .await
            .context("Failed to start rotation scheduler")?;
        info!(agents = self.config.node.agents.len(), "Key exchange daemon running");

        let mut ticker = interval(Duration::from_secs(self.config.node.status_interval_secs));
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let metrics = self.engine.metrics();
                    debug!(
                        key_generations = metrics.key_generations,
                        key_exchanges = metrics.key_exchanges,
                        key_rotations = metrics.key_rotations,
                        failed_exchanges = metrics.failed_exchanges,
                        hsm_operations = metrics.hsm_operations,
                        pairs = self.engine.shared_secret_pairs().len(),
                        "Engine status"
                    );
                }
            }
        }

        self.shutdown().await;
        Ok(self.engine.metrics())
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        self.engine.shutdown().await;
        info!("Shutdown complete");
    }

    /// Exchange, rotate and escrow between two throwaway agents
    pub async fn demo(&self) -> Result<DemoReport> {
        let (initiator, responder) = ("demo-alice", "demo-bob");
        for agent in [initiator, responder] {
            self.engine.generate_agent_key_pair(agent, None, None).await?;
        }

        let request = self
            .engine
            .initiate_key_exchange(initiator, responder, vec!["demo".to_string()])
            .await?;
        let response = self.engine.respond_to_key_exchange(&request, true).await?;
        let secret = self.engine.confirm_key_exchange(&response).await?;
        info!(secret_id = %secret.secret_id, pair = %secret.pair, "Demo exchange established");

        let rotation = self.engine.emergency_key_rotation(Some(initiator)).await?;
        if !rotation.pending_secrets.is_empty() {
            anyhow::bail!("Secrets left pending after rotation: {:?}", rotation.pending_secrets);
        }
        let rotated = self.engine.shared_secret_info(initiator, responder)?;

        let (escrow_threshold, escrow_total) = (3, 5);
        let shares = self
            .engine
            .escrow_shared_secret(initiator, responder, escrow_threshold, escrow_total)?;
        let recovered = self
            .engine
            .reconstruct_secret_from_shares(&shares[escrow_total - escrow_threshold..])?;
        let current = self.engine.get_shared_secret(initiator, responder)?;

        Ok(DemoReport {
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            secret_hash: secret.shared_secret_hash().to_hex(),
            rotated_secret_hash: rotated.shared_secret_hash.to_hex(),
            escrow_threshold,
            escrow_total,
            escrow_recovered: recovered.as_bytes() == current.derived_keys.encryption_key.as_bytes(),
        })
    }

    /// Split a hex secret into JSON-encoded sealed shares
    pub fn split(&self, secret_hex: &str, threshold: usize, total: usize) -> Result<String> {
        let secret = hex::decode(secret_hex.trim()).context("Secret is not valid hex")?;
        let shares = self
            .engine
            .generate_distributed_key_shares(&secret, threshold, total)?;
        serde_json::to_string_pretty(&shares).context("Failed to encode shares")
    }

    /// Recombine JSON-encoded shares into the hex secret
    pub fn combine(&self, shares_json: &str) -> Result<String> {
        let shares: Vec<DistributedKeyShare> =
            serde_json::from_str(shares_json).context("Failed to parse shares")?;
        for share in &shares {
            self.engine
                .verify_share(share)
                .with_context(|| format!("Share {} failed verification", share.share_index))?;
        }
        let secret = self.engine.reconstruct_secret_from_shares(&shares)?;
        Ok(hex::encode(secret.as_bytes()))
    }
}

fn log_event(envelope: &EventEnvelope) {
    match &envelope.event {
        EngineEvent::ExchangeFailed { request_id, from, to, reason } => {
            warn!(sequence = envelope.sequence, %request_id, %from, %to, %reason, "Exchange failed");
        }
        EngineEvent::KeyRotationWarning { agent_id, key_id, reason } => {
            warn!(sequence = envelope.sequence, %agent_id, %key_id, ?reason, "Key rotation warning");
        }
        event => {
            info!(sequence = envelope.sequence, kind = event.kind().name(), "Engine event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon(toml: &str) -> KeyDaemon {
        KeyDaemon::new(toml::from_str(toml).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_demo_round_trip() {
        let daemon = daemon("");
        let report = daemon.demo().await.unwrap();

        assert_ne!(report.secret_hash, report.rotated_secret_hash);
        assert!(report.escrow_recovered);
        assert_eq!(daemon.engine().metrics().key_rotations, 1);
    }

    #[tokio::test]
    async fn test_run_provisions_and_stops() {
        let daemon = daemon("[node]\nagents = [\"alice\", \"bob\"]\n");
        let metrics = daemon.run(async {}).await.unwrap();

        assert_eq!(metrics.key_generations, 2);
        assert!(daemon.engine().is_shutting_down());
        assert!(daemon.engine().get_active_key("alice").is_ok());
    }

    #[test]
    fn test_split_and_combine_with_configured_key() {
        let config = "[vault]\nshare_key = \"0202020202020202020202020202020202020202020202020202020202020202\"\n";
        let splitter = daemon(config);
        let combiner = daemon(config);

        let json = splitter.split("deadbeefcafebabe", 2, 3).unwrap();
        let mut shares: Vec<DistributedKeyShare> = serde_json::from_str(&json).unwrap();
        shares.remove(0);

        let subset = serde_json::to_string(&shares).unwrap();
        assert_eq!(combiner.combine(&subset).unwrap(), "deadbeefcafebabe");
    }

    #[test]
    fn test_combine_rejects_shares_sealed_under_another_key() {
        let splitter = daemon("");
        let combiner = daemon("");

        let json = splitter.split("00112233", 2, 2).unwrap();
        assert!(combiner.combine(&json).is_err());
        assert!(splitter.split("zz", 2, 2).is_err());
    }
}
