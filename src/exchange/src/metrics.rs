//! Prometheus counters for the exchange engine

use crate::error::{ExchangeError, Result};
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

const NAMESPACE: &str = "a2a_keyx";

/// Monotonic engine counters, registered in a private registry
#[derive(Clone)]
pub struct ExchangeMetrics {
    pub key_generations: IntCounter,
    pub key_exchanges: IntCounter,
    pub key_rotations: IntCounter,
    pub failed_exchanges: IntCounter,
    pub hsm_operations: IntCounter,
    registry: Registry,
}

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub key_generations: u64,
    pub key_exchanges: u64,
    pub key_rotations: u64,
    pub failed_exchanges: u64,
    pub hsm_operations: u64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> std::result::Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl ExchangeMetrics {
    pub fn new() -> std::result::Result<Self, prometheus::Error> {
        let registry = Registry::new();

        Ok(Self {
            key_generations: counter(&registry, "key_generations_total", "Agent key pairs generated")?,
            key_exchanges: counter(&registry, "key_exchanges_total", "Key exchanges established")?,
            key_rotations: counter(&registry, "key_rotations_total", "Agent key rotations")?,
            failed_exchanges: counter(
                &registry,
                "failed_exchanges_total",
                "Key exchanges rejected or aborted",
            )?,
            hsm_operations: counter(&registry, "hsm_operations_total", "Calls made to the HSM provider")?,
            registry,
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            key_generations: self.key_generations.get(),
            key_exchanges: self.key_exchanges.get(),
            key_rotations: self.key_rotations.get(),
            failed_exchanges: self.failed_exchanges.get(),
            hsm_operations: self.hsm_operations.get(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export in Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ExchangeError::Validation(format!("metrics output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ExchangeMetrics::new().unwrap();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());

        metrics.key_generations.inc();
        metrics.failed_exchanges.inc_by(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.key_generations, 1);
        assert_eq!(snapshot.failed_exchanges, 3);
    }

    #[test]
    fn test_metrics_export() {
        let metrics = ExchangeMetrics::new().unwrap();
        metrics.hsm_operations.inc();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("a2a_keyx_hsm_operations_total 1"));
        assert!(text.contains("a2a_keyx_key_exchanges_total 0"));
    }

    #[test]
    fn test_engines_do_not_share_counters() {
        let a = ExchangeMetrics::new().unwrap();
        let b = ExchangeMetrics::new().unwrap();
        a.key_rotations.inc();
        assert_eq!(b.key_rotations.get(), 0);
    }
}
