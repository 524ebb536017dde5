//! Agent key bundles.
//!
//! An agent key couples an X25519 exchange key (used for ECDH) with an
//! Ed25519 signing key (used to sign protocol messages). Both halves are
//! generated together and rotated together.

use crate::error::{CryptoError, Result};
use crate::hash::Blake3Hash;
use crate::kex::x25519;
use crate::sensitive::SensitiveBytes32;
use crate::signatures::ed25519;
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Length of the serialized public bundle (exchange key || verifying key)
pub const PUBLIC_KEY_BUNDLE_LEN: usize = 64;

/// Public half of an agent key bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentPublicKey {
    /// X25519 public key
    pub exchange: [u8; 32],
    /// Ed25519 verifying key
    pub verifying: [u8; 32],
}

impl AgentPublicKey {
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_BUNDLE_LEN] {
        let mut out = [0u8; PUBLIC_KEY_BUNDLE_LEN];
        out[..32].copy_from_slice(&self.exchange);
        out[32..].copy_from_slice(&self.verifying);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_BUNDLE_LEN {
            return Err(CryptoError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_BUNDLE_LEN,
                bytes.len()
            )));
        }
        let mut exchange = [0u8; 32];
        let mut verifying = [0u8; 32];
        exchange.copy_from_slice(&bytes[..32]);
        verifying.copy_from_slice(&bytes[32..]);
        Ok(Self { exchange, verifying })
    }

    /// Stable identifier of the bundle
    pub fn fingerprint(&self) -> Blake3Hash {
        Blake3Hash::hash_parts(&[b"a2a-keyx/public-key", &self.exchange, &self.verifying])
    }

    /// Verify an Ed25519 signature made by the matching secret key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        ed25519::verify(&self.verifying, message, signature)
    }
}

/// Secret half of an agent key bundle
#[derive(Clone)]
pub struct AgentSecretKey {
    exchange: StaticSecret,
    signing: SigningKey,
}

impl AgentSecretKey {
    /// Generate a fresh bundle from the OS RNG
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        let exchange = StaticSecret::random_from_rng(csprng);
        let mut seed = [0u8; 32];
        csprng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();

        AgentSecretKey { exchange, signing }
    }

    pub fn public_key(&self) -> AgentPublicKey {
        AgentPublicKey {
            exchange: X25519PublicKey::from(&self.exchange).to_bytes(),
            verifying: self.signing.verifying_key().to_bytes(),
        }
    }

    /// Sign a message with the Ed25519 half
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// X25519 agreement with a peer's exchange key
    pub fn diffie_hellman(&self, peer: &AgentPublicKey) -> Result<SensitiveBytes32> {
        x25519::diffie_hellman(&self.exchange, &peer.exchange)
    }
}

impl fmt::Debug for AgentSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSecretKey")
            .field("public", &self.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}
