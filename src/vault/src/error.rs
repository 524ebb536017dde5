//! Error types for the vault module

use a2a_crypto::CryptoError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("Invalid share: {0}")]
    ShareInvalid(String),

    #[error("Inconsistent shares: {0}")]
    InconsistentShares(String),

    #[error("HSM unavailable: {0}")]
    HsmUnavailable(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
