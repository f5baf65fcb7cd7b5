//! The explicitly constructed registry shared by one set of runs.
//!
//! Breakers and health probes protect external dependencies rather than
//! per-run data, so every workflow, batch item and recovery attempt built
//! from the same [`ServiceRegistry`] shares them. Tests build a fresh
//! registry per case.

use std::sync::Arc;

use crate::circuit::{CircuitBreaker, CircuitBreakerRegistry};
use crate::config::FlowConfig;
use crate::errors::FlowResult;
use crate::health::{HealthMonitor, HealthProbe};
use crate::observability::{Monitor, Telemetry};

/// Configuration, telemetry, breakers and health probes for a set of runs.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    config: Arc<FlowConfig>,
    telemetry: Telemetry,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthMonitor>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(FlowConfig::default())
    }
}

impl ServiceRegistry {
    /// Builds a registry that logs through `tracing`.
    #[must_use]
    pub fn new(config: FlowConfig) -> Self {
        Self::with_telemetry(config, Telemetry::tracing())
    }

    /// Builds a registry reporting to `telemetry`.
    #[must_use]
    pub fn with_telemetry(config: FlowConfig, telemetry: Telemetry) -> Self {
        let breakers = CircuitBreakerRegistry::new(config.breakers.clone())
            .with_telemetry(telemetry.clone());
        let health =
            HealthMonitor::new(config.health.cache_ttl()).with_telemetry(telemetry.clone());
        Self {
            config: Arc::new(config),
            telemetry,
            breakers: Arc::new(breakers),
            health: Arc::new(health),
        }
    }

    /// Builds a registry from `TICKETFLOW_*` environment variables.
    pub fn from_env() -> FlowResult<Self> {
        Ok(Self::new(FlowConfig::from_env()?))
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// The shared telemetry.
    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// The shared monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<Monitor> {
        self.telemetry.monitor()
    }

    /// The shared breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The breaker protecting `name`, created on first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(name)
    }

    /// The shared health monitor.
    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Registers a liveness probe for a dependency.
    pub fn register_service(&self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        self.health.register_service(name, probe);
    }
}
