//! Daemon configuration loading and validation

use a2a_crypto::SensitiveBytes32;
use a2a_exchange::{EngineConfig, KeyRotationPolicy, TrustedCaSet};
use a2a_vault::{HsmConfig, HsmCredentials};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub policy: PolicySection,

    #[serde(default)]
    pub exchange: ExchangeSection,

    #[serde(default)]
    pub hsm: HsmSection,

    #[serde(default)]
    pub vault: VaultSection,

    #[serde(default)]
    pub trust: TrustSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSection {
    /// Agents given a key pair at startup
    #[serde(default)]
    pub agents: Vec<String>,
    /// Log every engine event at info level
    #[serde(default = "default_log_events")]
    pub log_events: bool,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicySection {
    #[serde(default = "default_true")]
    pub automatic_rotation: bool,
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,
    #[serde(default = "default_max_key_usage")]
    pub max_key_usage: u64,
    #[serde(default = "default_key_lifetime")]
    pub key_lifetime_secs: u64,
    #[serde(default = "default_pre_rotation_warning")]
    pub pre_rotation_warning_secs: u64,
    #[serde(default = "default_true")]
    pub emergency_rotation: bool,
    #[serde(default)]
    pub quantum_safe_transition: bool,
    #[serde(default = "default_usage_warning_ratio")]
    pub usage_warning_ratio: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeSection {
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,
    #[serde(default = "default_grace_period")]
    pub rotation_grace_period_secs: u64,
    #[serde(default = "default_min_tick")]
    pub min_scheduler_tick_secs: u64,
    #[serde(default = "default_superseded_retention")]
    pub superseded_retention: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub require_certificates: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HsmSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub key_label: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub key_generation: bool,
    #[serde(default)]
    pub key_storage: bool,
    #[serde(default)]
    pub signing: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VaultSection {
    /// Hex-encoded 32-byte key sealing threshold shares; random when unset
    #[serde(default)]
    pub share_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TrustSection {
    #[serde(default)]
    pub issuers: Vec<IssuerEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IssuerEntry {
    pub name: String,
    /// Hex-encoded Ed25519 verifying key
    pub verifying_key: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            log_events: default_log_events(),
            status_interval_secs: default_status_interval(),
        }
    }
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            automatic_rotation: true,
            rotation_interval_secs: default_rotation_interval(),
            max_key_usage: default_max_key_usage(),
            key_lifetime_secs: default_key_lifetime(),
            pre_rotation_warning_secs: default_pre_rotation_warning(),
            emergency_rotation: true,
            quantum_safe_transition: false,
            usage_warning_ratio: default_usage_warning_ratio(),
        }
    }
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            freshness_window_secs: default_freshness_window(),
            rotation_grace_period_secs: default_grace_period(),
            min_scheduler_tick_secs: default_min_tick(),
            superseded_retention: default_superseded_retention(),
            cache_ttl_secs: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
            require_certificates: false,
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_log_events() -> bool { true }
fn default_status_interval() -> u64 { 60 }
fn default_rotation_interval() -> u64 { 24 * 60 * 60 }
fn default_max_key_usage() -> u64 { 10_000 }
fn default_key_lifetime() -> u64 { 7 * 24 * 60 * 60 }
fn default_pre_rotation_warning() -> u64 { 60 * 60 }
fn default_usage_warning_ratio() -> f64 { 0.9 }
fn default_freshness_window() -> u64 { 300 }
fn default_grace_period() -> u64 { 60 }
fn default_min_tick() -> u64 { 1 }
fn default_superseded_retention() -> usize { 16 }
fn default_cache_ttl() -> u64 { 300 }
fn default_cache_capacity() -> usize { 4096 }

impl NodeConfig {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read configuration file {:?}", path.as_ref()))?;

        let config: NodeConfig = toml::from_str(&contents)
            .context("Failed to parse configuration file")?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.engine_config()
            .validate()
            .context("Invalid engine configuration")?;
        self.share_key()?;
        self.trusted_issuers()?;

        if self.node.agents.iter().any(|agent| agent.trim().is_empty()) {
            anyhow::bail!("Agent ids in [node].agents must not be empty");
        }
        if self.node.status_interval_secs == 0 {
            anyhow::bail!("[node].status_interval_secs must be > 0");
        }
        Ok(())
    }

    /// Typed engine configuration. Range checks happen in [`EngineConfig::validate`].
    pub fn engine_config(&self) -> EngineConfig {
        let policy = KeyRotationPolicy {
            automatic_rotation: self.policy.automatic_rotation,
            rotation_interval: Duration::from_secs(self.policy.rotation_interval_secs),
            max_key_usage: self.policy.max_key_usage,
            key_lifetime: Duration::from_secs(self.policy.key_lifetime_secs),
            pre_rotation_warning: Duration::from_secs(self.policy.pre_rotation_warning_secs),
            emergency_rotation: self.policy.emergency_rotation,
            quantum_safe_transition: self.policy.quantum_safe_transition,
            usage_warning_ratio: self.policy.usage_warning_ratio,
        };

        let hsm = HsmConfig {
            enabled: self.hsm.enabled,
            provider: self.hsm.provider.clone(),
            endpoint: self.hsm.endpoint.clone(),
            credentials: HsmCredentials {
                key_label: self.hsm.key_label.clone(),
                token: self.hsm.token.clone(),
            },
            key_generation: self.hsm.key_generation,
            key_storage: self.hsm.key_storage,
            signing: self.hsm.signing,
        };

        EngineConfig {
            policy,
            hsm,
            freshness_window: Duration::from_secs(self.exchange.freshness_window_secs),
            rotation_grace_period: Duration::from_secs(self.exchange.rotation_grace_period_secs),
            min_scheduler_tick: Duration::from_secs(self.exchange.min_scheduler_tick_secs),
            superseded_retention: self.exchange.superseded_retention,
            cache_ttl: Duration::from_secs(self.exchange.cache_ttl_secs),
            cache_capacity: self.exchange.cache_capacity,
            require_certificates: self.exchange.require_certificates,
        }
    }

    pub fn share_key(&self) -> Result<Option<SensitiveBytes32>> {
        let Some(encoded) = &self.vault.share_key else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded.trim()).context("[vault].share_key is not valid hex")?;
        let key = SensitiveBytes32::from_slice(&bytes)
            .with_context(|| format!("[vault].share_key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Some(key))
    }

    pub fn trusted_issuers(&self) -> Result<TrustedCaSet> {
        let mut issuers = HashMap::new();
        for entry in &self.trust.issuers {
            let bytes = hex::decode(entry.verifying_key.trim())
                .with_context(|| format!("Verifying key of issuer {} is not valid hex", entry.name))?;
            let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("Verifying key of issuer {} must be 32 bytes", entry.name)
            })?;
            if issuers.insert(entry.name.clone(), key).is_some() {
                anyhow::bail!("Issuer {} is listed twice", entry.name);
            }
        }
        Ok(TrustedCaSet::from_issuers(issuers))
    }
}
