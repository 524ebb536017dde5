use crate::error::{CryptoError, Result};
use crate::sensitive::SensitiveBytes32;
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 agreement between our static secret and a peer public key.
///
/// Rejects non-contributory results (peer sent a low-order point).
pub fn diffie_hellman(secret: &StaticSecret, peer_public: &[u8; 32]) -> Result<SensitiveBytes32> {
    let peer = PublicKey::from(*peer_public);
    let shared = secret.diffie_hellman(&peer);
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(SensitiveBytes32::new(*shared.as_bytes()))
}
