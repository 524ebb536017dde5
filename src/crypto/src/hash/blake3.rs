use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 hash output (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash([u8; 32]);

impl Blake3Hash {
    /// Hash data using BLAKE3
    pub fn hash(data: &[u8]) -> Self {
        Blake3Hash(*blake3::hash(data).as_bytes())
    }

    /// Hash a sequence of length-prefixed parts.
    ///
    /// Each part is preceded by its length as a little-endian u64, so
    /// `["ab", "c"]` and `["a", "bc"]` never collide.
    pub fn hash_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Blake3Hash(*hasher.finalize().as_bytes())
    }

    /// Hash data with keyed mode
    pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> Self {
        let mut hasher = Hasher::new_keyed(key);
        hasher.update(data);
        Blake3Hash(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Blake3Hash(bytes)
    }

    /// Get hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Constant-time comparison.
    pub fn ct_eq(&self, other: &Blake3Hash) -> bool {
        blake3::Hash::from(self.0) == blake3::Hash::from(other.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3Hash({})", self.to_hex())
    }
}

/// Derive a 32-byte key from input keying material using BLAKE3's
/// key derivation mode. `context` must be a hardcoded, globally unique string.
pub fn derive_key(context: &str, ikm: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, ikm)
}
