//! Registry of liveness probes with cached results.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::HealthProbe;
use crate::events::StructuredEvent;
use crate::observability::Telemetry;

/// Observable status of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Result of the last probe. Services start healthy.
    pub healthy: bool,
    /// When the service was last probed.
    pub last_check: Option<DateTime<Utc>>,
    /// Consecutive failed probes.
    pub failure_count: u32,
}

struct ServiceEntry {
    probe: Arc<dyn HealthProbe>,
    healthy: bool,
    checked_at: Option<Instant>,
    last_check: Option<DateTime<Utc>>,
    failure_count: u32,
}

/// Tracks the health of named dependencies.
///
/// `is_service_healthy` reuses a probe result for `cache_ttl`; after that
/// the next query probes again. A zero TTL probes on every query.
pub struct HealthMonitor {
    services: RwLock<HashMap<String, ServiceEntry>>,
    cache_ttl: Duration,
    telemetry: Option<Telemetry>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HealthMonitor {
    /// Creates a monitor with the given cache TTL.
    #[must_use]
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            cache_ttl,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Registers or replaces a service probe.
    pub fn register_service(&self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        let name = name.into();
        self.services.write().insert(
            name.clone(),
            ServiceEntry {
                probe,
                healthy: true,
                checked_at: None,
                last_check: None,
                failure_count: 0,
            },
        );
        debug!(service = %name, "Service registered for health monitoring");
        self.emit(StructuredEvent::info("service_registered", "health").with_field("service_name", name));
    }

    /// Returns true if a probe is registered under `name`.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// Returns whether a service is healthy, probing when the cached result
    /// is stale. Unregistered services are unhealthy.
    pub async fn is_service_healthy(&self, name: &str) -> bool {
        let cached = {
            let services = self.services.read();
            let Some(entry) = services.get(name) else {
                return false;
            };
            entry
                .checked_at
                .filter(|at| at.elapsed() < self.cache_ttl)
                .map(|_| entry.healthy)
        };
        match cached {
            Some(healthy) => healthy,
            None => self.check_service_health(name).await,
        }
    }

    /// Probes a service now and records the result. Unregistered services
    /// are unhealthy.
    pub async fn check_service_health(&self, name: &str) -> bool {
        let Some(probe) = self.services.read().get(name).map(|e| e.probe.clone()) else {
            return false;
        };

        let outcome = AssertUnwindSafe(probe.check()).catch_unwind().await;
        let (healthy, error) = match outcome {
            Ok(Ok(healthy)) => (healthy, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("health probe panicked".to_string())),
        };

        let (was_healthy, failure_count) = {
            let mut services = self.services.write();
            let Some(entry) = services.get_mut(name) else {
                return false;
            };
            let was_healthy = entry.healthy;
            entry.healthy = healthy;
            entry.checked_at = Some(Instant::now());
            entry.last_check = Some(Utc::now());
            if healthy {
                entry.failure_count = 0;
            } else {
                entry.failure_count += 1;
            }
            (was_healthy, entry.failure_count)
        };

        if let Some(error) = error {
            warn!(service = %name, error = %error, "Health check errored");
            self.emit(
                StructuredEvent::error("service_health_check_error", "health")
                    .with_field("service_name", name)
                    .with_field("error", error),
            );
        } else if !healthy {
            warn!(service = %name, failure_count, "Health check failed");
            self.emit(
                StructuredEvent::warn("service_health_check_failed", "health")
                    .with_field("service_name", name)
                    .with_field("failure_count", failure_count),
            );
        } else if !was_healthy {
            self.emit(StructuredEvent::info("service_recovered", "health").with_field("service_name", name));
        }
        healthy
    }

    /// Probes every registered service.
    pub async fn check_all(&self) -> BTreeMap<String, bool> {
        let names: Vec<String> = self.services.read().keys().cloned().collect();
        let mut results = BTreeMap::new();
        for name in names {
            let healthy = self.check_service_health(&name).await;
            results.insert(name, healthy);
        }
        results
    }

    /// Status of every registered service.
    #[must_use]
    pub fn get_service_status(&self) -> BTreeMap<String, ServiceStatus> {
        self.services
            .read()
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    ServiceStatus {
                        healthy: entry.healthy,
                        last_check: entry.last_check,
                        failure_count: entry.failure_count,
                    },
                )
            })
            .collect()
    }

    fn emit(&self, event: StructuredEvent) {
        if let Some(ref telemetry) = self.telemetry {
            telemetry.emit(event);
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("services", &self.services.read().keys().collect::<Vec<_>>())
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FlowError, FlowResult};
    use crate::health::FnProbe;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingProbe {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn check(&self) -> FlowResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.healthy.load(Ordering::SeqCst))
        }
    }

    struct ErrorProbe;

    #[async_trait]
    impl HealthProbe for ErrorProbe {
        async fn check(&self) -> FlowResult<bool> {
            Err(FlowError::Connection("refused".into()))
        }
    }

    struct PanickingProbe;

    #[async_trait]
    impl HealthProbe for PanickingProbe {
        async fn check(&self) -> FlowResult<bool> {
            panic!("probe exploded")
        }
    }

    fn counting(healthy: bool) -> Arc<CountingProbe> {
        Arc::new(CountingProbe {
            healthy: AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_unregistered_service_is_unhealthy() {
        let monitor = HealthMonitor::default();
        assert!(!monitor.is_service_healthy("missing").await);
        assert!(!monitor.check_service_health("missing").await);
    }

    #[tokio::test]
    async fn test_cached_result_is_reused_within_ttl() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let probe = counting(true);
        monitor.register_service("reasoning", probe.clone());

        assert!(monitor.is_service_healthy("reasoning").await);
        assert!(monitor.is_service_healthy("reasoning").await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        probe.healthy.store(false, Ordering::SeqCst);
        assert!(monitor.is_service_healthy("reasoning").await);
        assert!(!monitor.check_service_health("reasoning").await);
        assert!(!monitor.is_service_healthy("reasoning").await);
    }

    #[tokio::test]
    async fn test_zero_ttl_probes_every_time() {
        let monitor = HealthMonitor::new(Duration::ZERO);
        let probe = counting(true);
        monitor.register_service("compiler", probe.clone());

        for _ in 0..3 {
            assert!(monitor.is_service_healthy("compiler").await);
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_count_tracks_consecutive_failures() {
        let monitor = HealthMonitor::new(Duration::ZERO);
        let probe = counting(false);
        monitor.register_service("ticket_source", probe.clone());

        monitor.check_service_health("ticket_source").await;
        monitor.check_service_health("ticket_source").await;
        assert_eq!(monitor.get_service_status()["ticket_source"].failure_count, 2);

        probe.healthy.store(true, Ordering::SeqCst);
        monitor.check_service_health("ticket_source").await;
        let status = &monitor.get_service_status()["ticket_source"];
        assert!(status.healthy);
        assert_eq!(status.failure_count, 0);
        assert!(status.last_check.is_some());
    }

    #[tokio::test]
    async fn test_probe_errors_and_panics_are_unhealthy() {
        let monitor = HealthMonitor::new(Duration::ZERO);
        monitor.register_service("erroring", Arc::new(ErrorProbe));
        monitor.register_service("panicking", Arc::new(PanickingProbe));

        assert!(!monitor.is_service_healthy("erroring").await);
        assert!(!monitor.is_service_healthy("panicking").await);
        assert_eq!(monitor.get_service_status()["panicking"].failure_count, 1);
    }

    #[tokio::test]
    async fn test_check_all_and_fn_probe() {
        let monitor = HealthMonitor::default();
        monitor.register_service("up", Arc::new(FnProbe::new(|| true)));
        monitor.register_service("down", Arc::new(FnProbe::new(|| false)));

        let results = monitor.check_all().await;
        assert_eq!(results["up"], true);
        assert_eq!(results["down"], false);
        assert!(monitor.is_registered("up"));
    }

    #[test]
    fn test_registered_services_start_healthy() {
        let monitor = HealthMonitor::default();
        monitor.register_service("fs", Arc::new(FnProbe::new(|| true)));
        let status = &monitor.get_service_status()["fs"];
        assert!(status.healthy);
        assert!(status.last_check.is_none());
    }
}
