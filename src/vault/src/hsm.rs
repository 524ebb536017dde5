//! Hardware security module boundary.
//!
//! The engine never talks to a device directly. It consumes an [`HsmProvider`]
//! and decides per operation whether the provider must be used, based on
//! [`HsmConfig`]. Once an operation is routed to the HSM it never falls back
//! to software keys: an unreachable provider is [`VaultError::HsmUnavailable`].

use crate::error::{Result, VaultError};
use a2a_crypto::{AgentPublicKey, SensitiveBytes32};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credentials handed to the provider on connect
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmCredentials {
    /// Label of the key slot or partition
    pub key_label: Option<String>,
    /// PIN / API token
    pub token: Option<String>,
}

impl fmt::Debug for HsmCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmCredentials")
            .field("key_label", &self.key_label)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// HSM routing configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmConfig {
    pub enabled: bool,
    pub provider: String,
    pub endpoint: Option<String>,
    pub credentials: HsmCredentials,
    /// Generate agent keys inside the HSM
    pub key_generation: bool,
    /// Keep private keys inside the HSM
    pub key_storage: bool,
    /// Sign inside the HSM
    pub signing: bool,
}

/// Partial update applied with [`HsmConfig::merged`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HsmConfigUpdate {
    pub enabled: Option<bool>,
    pub provider: Option<String>,
    pub endpoint: Option<Option<String>>,
    pub credentials: Option<HsmCredentials>,
    pub key_generation: Option<bool>,
    pub key_storage: Option<bool>,
    pub signing: Option<bool>,
}

impl HsmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.provider.trim().is_empty() {
            return Err(VaultError::Validation(
                "HSM is enabled but no provider is named".to_string(),
            ));
        }
        if self.key_generation && !self.key_storage {
            return Err(VaultError::Validation(
                "HSM key generation requires HSM key storage".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `update` and validate the result; `self` is left untouched on error.
    pub fn merged(&self, update: &HsmConfigUpdate) -> Result<HsmConfig> {
        let mut next = self.clone();
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(provider) = &update.provider {
            next.provider = provider.clone();
        }
        if let Some(endpoint) = &update.endpoint {
            next.endpoint = endpoint.clone();
        }
        if let Some(credentials) = &update.credentials {
            next.credentials = credentials.clone();
        }
        if let Some(key_generation) = update.key_generation {
            next.key_generation = key_generation;
        }
        if let Some(key_storage) = update.key_storage {
            next.key_storage = key_storage;
        }
        if let Some(signing) = update.signing {
            next.signing = signing;
        }
        next.validate()?;
        Ok(next)
    }

    /// New keys must be generated (and then held) by the HSM
    pub fn delegates_generation(&self) -> bool {
        self.enabled && self.key_generation
    }

    pub fn delegates_signing(&self) -> bool {
        self.enabled && self.signing
    }
}

/// Opaque reference to a private key that never leaves the HSM
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HsmKeyHandle {
    pub provider: String,
    pub key_ref: String,
}

/// Parameters for HSM-side generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsmKeyRequest {
    pub agent_id: String,
    pub key_id: String,
    pub algorithm: String,
}

/// Result of HSM-side generation: a handle plus the exportable public half
#[derive(Debug, Clone)]
pub struct HsmGeneratedKey {
    pub handle: HsmKeyHandle,
    pub public_key: AgentPublicKey,
}

/// Capability surface of an HSM.
///
/// Implementations report every transport or device failure as
/// [`VaultError::HsmUnavailable`].
#[async_trait]
pub trait HsmProvider: Send + Sync {
    /// Provider name, matched against [`HsmConfig::provider`]
    fn name(&self) -> &str;

    async fn generate_key_pair(&self, request: &HsmKeyRequest) -> Result<HsmGeneratedKey>;

    async fn get_private_key_handle(&self, key_id: &str) -> Result<HsmKeyHandle>;

    async fn sign(&self, handle: &HsmKeyHandle, message: &[u8]) -> Result<Vec<u8>>;

    /// X25519 agreement with the exchange key behind `handle`
    async fn diffie_hellman(&self, handle: &HsmKeyHandle, peer: &AgentPublicKey) -> Result<SensitiveBytes32>;
}
