//! Per-model failure isolation with durable state.

pub mod breaker;
pub mod store;

pub use breaker::{BreakerConfig, BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use store::{BreakerRecord, BreakerStore, InMemoryBreakerStore, SqliteBreakerStore};

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::plugin::ModelKey;

/// Independent breakers keyed by model version, created on first use.
pub struct BreakerRegistry {
    config: BreakerConfig,
    store: Arc<dyn BreakerStore>,
    breakers: DashMap<ModelKey, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, store: Arc<dyn BreakerStore>) -> Self {
        Self {
            config,
            store,
            breakers: DashMap::new(),
        }
    }

    pub fn in_memory(config: BreakerConfig) -> Self {
        Self::new(config, Arc::new(InMemoryBreakerStore::new()))
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Load persisted breakers. Must run before traffic is accepted.
    pub fn restore(&self) -> anyhow::Result<usize> {
        let mut restored = 0;
        for record in self.store.load_all()? {
            match CircuitBreaker::restore(&record, self.config.clone(), Some(self.store.clone())) {
                Ok(breaker) => {
                    if breaker.state() != BreakerState::Closed {
                        warn!(
                            model_id = %record.model_id,
                            version = %record.version,
                            "Restored open circuit (retry after {:?})",
                            record.retry_after
                        );
                    }
                    self.breakers.insert(breaker.key().clone(), Arc::new(breaker));
                    restored += 1;
                }
                Err(e) => warn!("Skipping breaker record for {}: {}", record.model_id, e),
            }
        }
        info!("Restored {} circuit breakers", restored);
        Ok(restored)
    }

    pub fn get(&self, key: &ModelKey) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    key.clone(),
                    self.config.clone(),
                    Some(self.store.clone()),
                ))
            })
            .value()
            .clone()
    }

    /// Closed for models that never had a breaker.
    pub fn state_of(&self, key: &ModelKey) -> BreakerState {
        self.breakers
            .get(key)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self, key: &ModelKey) -> Option<BreakerSnapshot> {
        self.breakers.get(key).map(|b| b.snapshot())
    }
}
