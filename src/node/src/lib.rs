//! A2A key exchange daemon library
//!
//! Wraps one [`a2a_exchange::KeyExchangeEngine`] with TOML configuration,
//! agent provisioning, the rotation scheduler lifecycle and share tooling.

pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::{DemoReport, KeyDaemon};
