pub mod generation;

pub use generation::{AgentPublicKey, AgentSecretKey};
