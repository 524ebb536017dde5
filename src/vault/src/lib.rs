//! # A2A Vault Module
//!
//! Custody primitives for the key exchange engine.
//!
//! ## Features
//!
//! - **Threshold Sharing**: Shamir split/reconstruct over GF(2^61 - 1)
//! - **Share Commitments**: BLAKE3 Merkle commitments with per-share proofs
//! - **Sealed Shares**: XChaCha20-Poly1305 encryption of every share at rest
//! - **Hardware Integration**: HSM capability boundary and routing config
//!
//! ## Module Structure
//!
//! ```text
//! vault/
//! ├── field       - Prime field arithmetic and secret chunking
//! ├── commitment  - Merkle commitments and proofs
//! ├── shamir      - ThresholdSecretSharing
//! └── hsm         - HSM provider trait and configuration
//! ```

pub mod commitment;
pub mod error;
pub mod field;
pub mod hsm;
pub mod shamir;

pub use commitment::{ShareCommitment, VerificationProof};
pub use error::{Result, VaultError};
pub use hsm::{
    HsmConfig, HsmConfigUpdate, HsmCredentials, HsmGeneratedKey, HsmKeyHandle, HsmKeyRequest, HsmProvider,
};
pub use shamir::{DistributedKeyShare, ThresholdSecretSharing};
