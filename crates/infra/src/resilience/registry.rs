use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::breaker::{BreakerStats, CircuitBreaker, CircuitState};
use super::config::BreakerConfig;

/// Health snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerHealth {
    pub state: CircuitState,
    pub stats: BreakerStats,
    pub fallback_executions: u64,
}

/// Named breakers shared across the process.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The breaker named `config.name`, created from `config` on first use.
    pub fn register(&self, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(&config.name) {
            return existing.clone();
        }
        self.breakers
            .write()
            .entry(config.name.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn health(&self) -> BTreeMap<String, BreakerHealth> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| {
                let stats = breaker.stats();
                (
                    name.clone(),
                    BreakerHealth {
                        state: breaker.state(),
                        fallback_executions: stats.fallbacks,
                        stats,
                    },
                )
            })
            .collect()
    }
}
