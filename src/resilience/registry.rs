//! Name → breaker registry.
//!
//! One registry is meant to live as long as the process (or the HTTP client
//! stack that owns it) and be handed to every transport that talks to the
//! same upstreams. Entries are never evicted: the set of names is the set of
//! logical upstreams in use, so memory is bounded by that, and a misspelled
//! name just yields an idle breaker.

use super::circuit_breaker::CircuitBreaker;
use super::config::BreakerConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Registry whose breakers use the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose breakers are all created with `cfg`.
    pub fn with_config(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = breakers.get(name) {
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, self.cfg.clone()));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn len(&self) -> usize {
        self.breakers
            .lock()
            .map(|b| b.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names with a breaker, sorted.
    pub fn names(&self) -> Vec<String> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = breakers.keys().cloned().collect();
        names.sort();
        names
    }
}
