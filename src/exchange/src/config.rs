//! Engine configuration and the runtime-updatable rotation policy

use crate::error::{ExchangeError, Result};
use crate::keys::KeyAlgorithm;
use a2a_vault::HsmConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Key rotation policy
///
/// Changes apply to keys and secrets created afterwards; existing records
/// keep the expiry and usage limits they were created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRotationPolicy {
    pub automatic_rotation: bool,
    pub rotation_interval: Duration,
    pub max_key_usage: u64,
    pub key_lifetime: Duration,
    pub pre_rotation_warning: Duration,
    pub emergency_rotation: bool,
    pub quantum_safe_transition: bool,
    /// Fraction of `max_key_usage` at which a usage warning fires
    pub usage_warning_ratio: f64,
}

impl Default for KeyRotationPolicy {
    fn default() -> Self {
        KeyRotationPolicy {
            automatic_rotation: true,
            rotation_interval: DAY,
            max_key_usage: 10_000,
            key_lifetime: 7 * DAY,
            pre_rotation_warning: HOUR,
            emergency_rotation: true,
            quantum_safe_transition: false,
            usage_warning_ratio: 0.9,
        }
    }
}

/// Partial policy update; `None` keeps the current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub automatic_rotation: Option<bool>,
    pub rotation_interval: Option<Duration>,
    pub max_key_usage: Option<u64>,
    pub key_lifetime: Option<Duration>,
    pub pre_rotation_warning: Option<Duration>,
    pub emergency_rotation: Option<bool>,
    pub quantum_safe_transition: Option<bool>,
    pub usage_warning_ratio: Option<f64>,
}

impl KeyRotationPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.rotation_interval.is_zero() {
            return Err(ExchangeError::Validation("rotation_interval must be > 0".to_string()));
        }
        if self.max_key_usage == 0 {
            return Err(ExchangeError::Validation("max_key_usage must be > 0".to_string()));
        }
        if self.key_lifetime.is_zero() {
            return Err(ExchangeError::Validation("key_lifetime must be > 0".to_string()));
        }
        if self.pre_rotation_warning >= self.key_lifetime {
            return Err(ExchangeError::Validation(format!(
                "pre_rotation_warning ({:?}) must be shorter than key_lifetime ({:?})",
                self.pre_rotation_warning, self.key_lifetime
            )));
        }
        if !(self.usage_warning_ratio > 0.0 && self.usage_warning_ratio <= 1.0) {
            return Err(ExchangeError::Validation(format!(
                "usage_warning_ratio must be in (0, 1], got {}",
                self.usage_warning_ratio
            )));
        }
        Ok(())
    }

    /// Apply `update` and validate the result. Nothing changes on error.
    pub fn merged(&self, update: &PolicyUpdate) -> Result<KeyRotationPolicy> {
        let next = KeyRotationPolicy {
            automatic_rotation: update.automatic_rotation.unwrap_or(self.automatic_rotation),
            rotation_interval: update.rotation_interval.unwrap_or(self.rotation_interval),
            max_key_usage: update.max_key_usage.unwrap_or(self.max_key_usage),
            key_lifetime: update.key_lifetime.unwrap_or(self.key_lifetime),
            pre_rotation_warning: update.pre_rotation_warning.unwrap_or(self.pre_rotation_warning),
            emergency_rotation: update.emergency_rotation.unwrap_or(self.emergency_rotation),
            quantum_safe_transition: update.quantum_safe_transition.unwrap_or(self.quantum_safe_transition),
            usage_warning_ratio: update.usage_warning_ratio.unwrap_or(self.usage_warning_ratio),
        };
        next.validate()?;
        Ok(next)
    }

    /// Algorithm used when a caller does not name one
    pub fn default_algorithm(&self) -> KeyAlgorithm {
        if self.quantum_safe_transition {
            KeyAlgorithm::Kyber
        } else {
            KeyAlgorithm::Ecdh
        }
    }

    /// Usage count at which a usage warning fires
    pub fn usage_warning_threshold(&self, max_usage: u64) -> u64 {
        ((max_usage as f64) * self.usage_warning_ratio).ceil() as u64
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub policy: KeyRotationPolicy,
    pub hsm: HsmConfig,
    /// Maximum |now - request.timestamp| accepted by a responder
    pub freshness_window: Duration,
    /// Time a rotated-out key stays `rotating` before it is revoked
    pub rotation_grace_period: Duration,
    /// Lower bound on the scheduler tick
    pub min_scheduler_tick: Duration,
    /// Superseded shared-secret records kept per pair
    pub superseded_retention: usize,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Reject requests that carry no capability certificate
    pub require_certificates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            policy: KeyRotationPolicy::default(),
            hsm: HsmConfig::default(),
            freshness_window: Duration::from_secs(300),
            rotation_grace_period: Duration::from_secs(60),
            min_scheduler_tick: Duration::from_secs(1),
            superseded_retention: 16,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 4096,
            require_certificates: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        self.hsm.validate()?;
        if self.freshness_window.is_zero() {
            return Err(ExchangeError::Validation("freshness_window must be > 0".to_string()));
        }
        if self.min_scheduler_tick.is_zero() {
            return Err(ExchangeError::Validation("min_scheduler_tick must be > 0".to_string()));
        }
        if self.cache_capacity == 0 {
            return Err(ExchangeError::Validation("cache_capacity must be > 0".to_string()));
        }
        Ok(())
    }

    /// Scheduler period: a tenth of the rotation interval, never below the minimum
    pub fn scheduler_tick(&self) -> Duration {
        (self.policy.rotation_interval / 10).max(self.min_scheduler_tick)
    }
}
