//! HKDF-SHA256 expansion of a raw agreement into independent sub-keys.

use crate::error::{CryptoError, Result};
use crate::hash::Blake3Hash;
use crate::sensitive::SensitiveBytes32;
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;

pub const LABEL_ENCRYPTION: &[u8] = b"a2a-keyx/encryption";
pub const LABEL_MAC: &[u8] = b"a2a-keyx/mac";
pub const LABEL_SIGNING: &[u8] = b"a2a-keyx/signing";

/// Expand `ikm` into a single 32-byte key bound to `info`.
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<SensitiveBytes32> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {}", e)))?;
    Ok(SensitiveBytes32::new(okm))
}

/// The three sub-keys derived from one agreement
#[derive(Clone)]
pub struct SessionKeys {
    pub encryption_key: SensitiveBytes32,
    pub mac_key: SensitiveBytes32,
    pub signing_key: SensitiveBytes32,
}

impl SessionKeys {
    /// Derive encryption, MAC and signing keys under distinct labels.
    pub fn derive(raw_secret: &SensitiveBytes32, salt: &[u8]) -> Result<Self> {
        Ok(SessionKeys {
            encryption_key: hkdf_expand(raw_secret.as_bytes(), salt, LABEL_ENCRYPTION)?,
            mac_key: hkdf_expand(raw_secret.as_bytes(), salt, LABEL_MAC)?,
            signing_key: hkdf_expand(raw_secret.as_bytes(), salt, LABEL_SIGNING)?,
        })
    }

    /// One-way digest of the encryption key, safe to put on the wire
    pub fn encryption_key_digest(&self) -> Blake3Hash {
        Blake3Hash::hash(self.encryption_key.as_bytes())
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("encryption_key_digest", &self.encryption_key_digest())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_keys_are_distinct() {
        let raw = SensitiveBytes32::new([9u8; 32]);
        let keys = SessionKeys::derive(&raw, b"salt").unwrap();
        assert_ne!(keys.encryption_key.as_bytes(), keys.mac_key.as_bytes());
        assert_ne!(keys.mac_key.as_bytes(), keys.signing_key.as_bytes());
        assert_ne!(keys.encryption_key.as_bytes(), keys.signing_key.as_bytes());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let raw = SensitiveBytes32::new([3u8; 32]);
        let a = SessionKeys::derive(&raw, b"salt").unwrap();
        let b = SessionKeys::derive(&raw, b"salt").unwrap();
        assert_eq!(a.encryption_key.as_bytes(), b.encryption_key.as_bytes());

        let c = SessionKeys::derive(&raw, b"other salt").unwrap();
        assert_ne!(a.encryption_key.as_bytes(), c.encryption_key.as_bytes());
    }
}
