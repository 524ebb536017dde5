//! # A2A Key Exchange Engine
//!
//! Establishes, stores and rotates session secrets between autonomous agents.
//!
//! ## Features
//!
//! - **Key lifecycle**: one active key per agent, graceful and emergency rotation, revocation
//! - **Exchange protocol**: signed request/response with freshness and replay checks
//! - **Shared secrets**: X25519 agreement expanded by HKDF into encryption, MAC and signing keys
//! - **Rotation scheduler**: periodic policy enforcement on a cancellable background task
//! - **HSM routing**: generation and signing delegated to an [`a2a_vault::HsmProvider`], fail-closed
//! - **Escrow**: threshold splitting of shared secrets across custodians
//! - **Observability**: ordered event bus and Prometheus counters
//!
//! ## Module Structure
//!
//! ```text
//! exchange/
//! ├── engine/      - KeyExchangeEngine facade and builder
//! ├── keys/        - KeyPairManager
//! ├── protocol/    - Request/response state machine
//! ├── store/       - SharedSecretStore
//! ├── rotation/    - RotationScheduler
//! ├── trust/       - Capability certificates and trusted issuers
//! ├── config/      - Engine configuration and rotation policy
//! ├── events/      - Event bus
//! ├── metrics/     - Prometheus counters
//! ├── cache/       - Lookup cache for public data
//! └── clock/       - Injectable time source
//! ```

pub mod cache;
pub mod clock;
pub mod config;
mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod keys;
pub mod metrics;
pub mod protocol;
pub mod rotation;
pub mod store;
pub mod trust;

pub use cache::{LookupCache, MemoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, KeyRotationPolicy, PolicyUpdate};
pub use engine::{EngineBuilder, KeyExchangeEngine};
pub use error::{ExchangeError, Result};
pub use events::{EngineEvent, EventEnvelope, EventKind, WarningReason};
pub use keys::{Curve, KeyAlgorithm, KeyOrigin, KeyPairInfo, KeyStatus, RotationOutcome};
pub use metrics::MetricsSnapshot;
pub use protocol::{ExchangeState, KeyExchangeRequest, KeyExchangeResponse, RejectionReason};
pub use store::{AgentPair, SharedSecret, SharedSecretInfo};
pub use trust::{CapabilityCertificate, CertificateAuthority, TrustedCaSet};
