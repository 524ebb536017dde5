//! Error types for the exchange module

use a2a_crypto::CryptoError;
use a2a_vault::VaultError;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Stale request: timestamp is {age_secs}s away from now, window is {window_secs}s")]
    StaleRequest { age_secs: i64, window_secs: u64 },

    #[error("Replayed request: {0}")]
    ReplayedRequest(Uuid),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key expired: {0}")]
    KeyExpired(String),

    #[error("Key revoked: {0}")]
    KeyRevoked(String),

    #[error("No shared secret for pair {0}")]
    NoSharedSecret(String),

    #[error("Shared secret for pair {0} must be renegotiated with the remote peer")]
    RenegotiationRequired(String),

    #[error("Insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("Invalid share: {0}")]
    ShareInvalid(String),

    #[error("Inconsistent shares: {0}")]
    InconsistentShares(String),

    #[error("HSM unavailable: {0}")]
    HsmUnavailable(String),

    #[error("Engine is shutting down")]
    EngineShuttingDown,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<VaultError> for ExchangeError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Validation(msg) => ExchangeError::Validation(msg),
            VaultError::InsufficientShares { have, need } => ExchangeError::InsufficientShares { have, need },
            VaultError::ShareInvalid(msg) => ExchangeError::ShareInvalid(msg),
            VaultError::InconsistentShares(msg) => ExchangeError::InconsistentShares(msg),
            VaultError::HsmUnavailable(msg) => ExchangeError::HsmUnavailable(msg),
            VaultError::Crypto(err) => ExchangeError::Crypto(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_errors_keep_their_category() {
        let err: ExchangeError = VaultError::InsufficientShares { have: 2, need: 3 }.into();
        assert!(matches!(err, ExchangeError::InsufficientShares { have: 2, need: 3 }));

        let err: ExchangeError = VaultError::HsmUnavailable("timeout".to_string()).into();
        assert!(matches!(err, ExchangeError::HsmUnavailable(_)));

        let err: ExchangeError = VaultError::Crypto(CryptoError::InvalidSecretKey).into();
        assert!(matches!(err, ExchangeError::Crypto(CryptoError::InvalidSecretKey)));
    }
}
