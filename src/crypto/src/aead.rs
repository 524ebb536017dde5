//! XChaCha20-Poly1305 sealing for data at rest.
//!
//! Sealed layout: `nonce (24 bytes) || ciphertext || tag (16 bytes)`.
//! The 24-byte nonce is drawn at random per seal.

use crate::error::{CryptoError, Result};
use crate::sensitive::{SensitiveBytes32, SensitiveVec};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Generate a random 256-bit sealing key.
pub fn generate_key() -> SensitiveBytes32 {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    SensitiveBytes32::new(key)
}

/// Encrypt and authenticate `plaintext`, binding `aad` without encrypting it.
pub fn seal(key: &SensitiveBytes32, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverse of [`seal`]. Fails if the key, the AAD or any sealed byte differs.
pub fn open(key: &SensitiveBytes32, sealed: &[u8], aad: &[u8]) -> Result<SensitiveVec> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Decryption("sealed payload too short".to_string()));
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;

    Ok(SensitiveVec::new(plaintext))
}
