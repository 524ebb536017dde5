//! # A2A Cryptography Module
//!
//! Primitives underneath the agent-to-agent key exchange engine.
//!
//! ## Features
//!
//! - **Agent keys**: X25519 exchange key + Ed25519 signing key, generated and rotated as one bundle
//! - **Key agreement**: X25519 ECDH with non-contributory output rejected
//! - **Key derivation**: HKDF-SHA256 expansion into encryption, MAC and signing sub-keys
//! - **Hashing**: BLAKE3 digests, keyed hashes and derive-key mode
//! - **Sealing**: XChaCha20-Poly1305 for secrets at rest
//! - **Secret hygiene**: zeroize-on-drop containers with redacted `Debug`
//!
//! ## Module Structure
//!
//! ```text
//! crypto/
//! ├── keys/          - Agent key bundles
//! ├── kex/           - ECDH and HKDF
//! ├── signatures/    - Ed25519 verification
//! ├── hash/          - BLAKE3
//! ├── aead           - XChaCha20-Poly1305 sealing
//! └── sensitive      - Zeroizing containers
//! ```

pub mod aead;
pub mod error;
pub mod hash;
pub mod keys;
pub mod kex;
pub mod sensitive;
pub mod signatures;

pub use error::{CryptoError, Result};
pub use hash::Blake3Hash;
pub use keys::{AgentPublicKey, AgentSecretKey};
pub use kex::SessionKeys;
pub use sensitive::{SensitiveBytes32, SensitiveVec};
