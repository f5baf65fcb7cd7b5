//! Shared breaker registry keyed by resource name.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{BreakerStatus, CircuitBreaker};
use crate::config::BreakerSettings;
use crate::observability::Telemetry;

/// Owns exactly one breaker per protected resource name.
///
/// Breakers are created on first use with the settings resolved for their
/// name and shared by every caller afterwards.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: BreakerSettings,
    telemetry: Option<Telemetry>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
            telemetry: None,
        }
    }

    /// Attaches telemetry to every breaker created afterwards.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(name, self.settings.config_for(name));
                Arc::new(match self.telemetry {
                    Some(ref telemetry) => breaker.with_telemetry(telemetry.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    /// Returns the breaker for `name` if it exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true when no breaker exists yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Status of every breaker, by name.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect()
    }

    /// Forces every breaker closed.
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }
}
