use crate::error::{CryptoError, Result};
use ed25519_dalek::{Signature, VerifyingKey};

/// Ed25519 signature length in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Verify `signature` over `message` with a raw Ed25519 verifying key.
///
/// Uses strict verification, rejecting malleable encodings and small-order keys.
pub fn verify(verifying_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(verifying_key)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    key.verify_strict(message, &signature)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}
