//! State shared by every engine component

use crate::cache::LookupCache;
use crate::clock::Clock;
use crate::config::{EngineConfig, KeyRotationPolicy};
use crate::error::{ExchangeError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::ExchangeMetrics;
use crate::trust::TrustedCaSet;
use a2a_vault::HsmProvider;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) struct EngineContext {
    config: RwLock<EngineConfig>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub metrics: ExchangeMetrics,
    pub cache: Arc<dyn LookupCache>,
    pub trusted: Arc<TrustedCaSet>,
    pub hsm: Option<Arc<dyn HsmProvider>>,
    pub shutdown: CancellationToken,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        metrics: ExchangeMetrics,
        cache: Arc<dyn LookupCache>,
        trusted: Arc<TrustedCaSet>,
        hsm: Option<Arc<dyn HsmProvider>>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            clock,
            events: EventBus::new(),
            metrics,
            cache,
            trusted,
            hsm,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn policy(&self) -> KeyRotationPolicy {
        self.config.read().policy.clone()
    }

    /// Replace the configuration if `update` produces a valid one
    pub fn update_config<F>(&self, update: F) -> Result<EngineConfig>
    where
        F: FnOnce(&EngineConfig) -> Result<EngineConfig>,
    {
        let mut config = self.config.write();
        let next = update(&config)?;
        next.validate()?;
        *config = next.clone();
        Ok(next)
    }

    pub fn emit(&self, event: EngineEvent) {
        self.events.emit(event, self.now());
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(ExchangeError::EngineShuttingDown)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
impl EngineContext {
    pub fn for_tests(config: EngineConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        use crate::cache::MemoryCache;

        Arc::new(Self::new(
            config,
            clock,
            ExchangeMetrics::new().expect("metrics"),
            Arc::new(MemoryCache::new(64)),
            Arc::new(TrustedCaSet::new()),
            None,
        ))
    }
}
