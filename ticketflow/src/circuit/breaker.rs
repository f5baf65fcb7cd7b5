//! Circuit breaker state machine.
//!
//! ```text
//! CLOSED --(failure_count >= threshold)--> OPEN
//! OPEN   --(recovery_timeout elapsed, next call)--> HALF_OPEN
//! HALF_OPEN --(success)--> CLOSED
//! HALF_OPEN --(failure)--> OPEN
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::{CircuitBreakerOpenError, FlowError, FlowResult};
use crate::events::{EventLevel, StructuredEvent};
use crate::observability::Telemetry;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast until the recovery timeout elapses.
    Open,
    /// A trial call is allowed through.
    HalfOpen,
}

impl CircuitState {
    /// Upper-case state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit. At least 1.
    pub failure_threshold: u32,
    /// Seconds to stay open before admitting a trial call.
    pub recovery_timeout_secs: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 30.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a config. A zero threshold is raised to 1.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout_secs: f64) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout_secs,
        }
    }

    /// Creates a config from a duration.
    #[must_use]
    pub fn with_timeout(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self::new(failure_threshold, recovery_timeout.as_secs_f64())
    }

    /// The recovery timeout as a duration.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs.max(0.0))
    }
}

/// Observable breaker status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStatus {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures counted since the last reset.
    pub failure_count: u32,
    /// Successful calls over the breaker's lifetime.
    pub success_count: u64,
    /// When the last failure was recorded.
    pub last_failure: Option<DateTime<Utc>>,
    /// When an open breaker will admit a trial call.
    pub next_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure: Option<DateTime<Utc>>,
    reopen_at: Option<Instant>,
    next_attempt: Option<DateTime<Utc>>,
}

/// A failure-rate gate for one protected resource.
///
/// All transitions happen under one lock, so concurrent callers sharing a
/// breaker never lose counter updates.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    telemetry: Option<Telemetry>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout_secs,
            "Circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                reopen_at: None,
                next_attempt: None,
            }),
            telemetry: None,
        }
    }

    /// Attaches telemetry for transition events and the state gauge.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        telemetry.metrics().set_gauge(
            "circuit_breaker.state",
            &[("name", self.name.as_str())],
            CircuitState::Closed.gauge_value(),
        );
        self.telemetry = Some(telemetry);
        self
    }

    /// The breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker parameters.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures counted since the last reset.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Admits or refuses a call.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to
    /// HALF_OPEN and admits the call.
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerOpenError> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.reopen_at.map_or(true, |at| Instant::now() >= at);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    drop(inner);
                    self.on_transition(CircuitState::HalfOpen, "circuit_breaker_half_open");
                    Ok(())
                } else {
                    Err(CircuitBreakerOpenError::new(self.name.clone(), inner.next_attempt))
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.success_count += 1;
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.reopen_at = None;
                inner.next_attempt = None;
                drop(inner);
                self.on_transition(CircuitState::Closed, "circuit_breaker_reset");
            }
            CircuitState::Open => {
                // A call admitted before another caller opened the circuit.
                debug!(breaker = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Open => {
                debug!(breaker = %self.name, "Failure recorded while circuit is open");
            }
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.last_failure = Some(Utc::now());
                let trip = state == CircuitState::HalfOpen
                    || inner.failure_count >= self.config.failure_threshold;
                if trip {
                    let timeout = self.config.recovery_timeout();
                    inner.state = CircuitState::Open;
                    inner.reopen_at = Some(Instant::now() + timeout);
                    inner.next_attempt = chrono::Duration::from_std(timeout)
                        .ok()
                        .map(|d| Utc::now() + d);
                    let failure_count = inner.failure_count;
                    drop(inner);
                    warn!(
                        breaker = %self.name,
                        failure_count,
                        recovery_timeout_secs = self.config.recovery_timeout_secs,
                        "Circuit breaker opened"
                    );
                    self.on_transition(CircuitState::Open, "circuit_breaker_opened");
                }
            }
        }
    }

    /// Runs `operation` under the breaker.
    ///
    /// Fails with [`FlowError::CircuitOpen`] without invoking the operation
    /// while the circuit is open. The operation's own error is returned
    /// unchanged after being counted.
    pub async fn call<F, Fut, T>(&self, operation: F) -> FlowResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlowResult<T>>,
    {
        self.try_acquire().map_err(FlowError::CircuitOpen)?;
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Returns the observable status.
    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
            next_attempt: inner.next_attempt,
        }
    }

    /// Forces the breaker closed and clears its counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.reopen_at = None;
        inner.next_attempt = None;
        drop(inner);
        if was != CircuitState::Closed {
            self.on_transition(CircuitState::Closed, "circuit_breaker_reset");
        }
    }

    fn on_transition(&self, to: CircuitState, event: &str) {
        info!(breaker = %self.name, state = %to, "Circuit breaker transition");
        if let Some(ref telemetry) = self.telemetry {
            telemetry
                .metrics()
                .set_gauge("circuit_breaker.state", &[("name", self.name.as_str())], to.gauge_value());
            let level = if to == CircuitState::Open {
                EventLevel::Warn
            } else {
                EventLevel::Info
            };
            telemetry.emit(
                StructuredEvent::new(level, event, "circuit_breaker")
                    .with_field("name", self.name.as_str())
                    .with_field("state", to.as_str()),
            );
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::observability::Monitor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig::with_timeout(threshold, timeout))
    }

    async fn fail(cb: &CircuitBreaker) -> FlowResult<()> {
        cb.call(|| async { Err::<(), _>(FlowError::Timeout("boom".into())) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> FlowResult<u32> {
        cb.call(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);
        assert!(cb.status().next_attempt.is_some());
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_invoke_operation() {
        let cb = breaker(1, Duration::from_secs(60));
        let _ = fail(&cb).await;

        let calls = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(FlowError::CircuitOpen(ref e)) if e.name == "test"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_not_counted_while_open() {
        let cb = breaker(2, Duration::from_secs(60));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_when_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_recovers_through_half_open() {
        let cb = breaker(2, Duration::from_secs(1));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.status().next_attempt.is_none());
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(20));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(succeed(&cb).await, Err(FlowError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_all_counted() {
        let cb = Arc::new(breaker(1000, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    cb.record_failure();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(cb.failure_count(), 500);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_transitions_are_reported() {
        let sink = Arc::new(CollectingEventSink::new());
        let telemetry = Telemetry::new(sink.clone(), Arc::new(Monitor::new()));
        let cb = breaker(1, Duration::from_millis(10)).with_telemetry(telemetry.clone());

        let _ = fail(&cb).await;
        assert_eq!(
            telemetry.metrics().gauge("circuit_breaker.state", &[("name", "test")]),
            Some(1.0)
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = succeed(&cb).await;

        assert_eq!(
            sink.names(),
            vec![
                "circuit_breaker_opened",
                "circuit_breaker_half_open",
                "circuit_breaker_reset"
            ]
        );
        assert_eq!(
            telemetry.metrics().gauge("circuit_breaker.state", &[("name", "test")]),
            Some(0.0)
        );
    }

    #[test]
    fn test_reset_and_status() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.last_failure.is_some());
        assert_eq!(serde_json::to_value(&status).unwrap()["state"], "OPEN");

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_zero_threshold_is_raised() {
        assert_eq!(CircuitBreakerConfig::new(0, 1.0).failure_threshold, 1);
    }
}
