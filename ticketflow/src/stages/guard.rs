//! Breaker-guarded stage execution.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::{Stage, StageCategory};
use crate::circuit::{CircuitBreaker, CircuitBreakerRegistry};
use crate::errors::{FlowError, FlowResult};
use crate::events::StructuredEvent;
use crate::observability::Telemetry;
use crate::state::CodeGenerationState;
use crate::tools::ToolSet;

/// Wraps a stage with the breaker registered under the stage's name.
///
/// While the breaker is open the inner stage is not invoked. Every other
/// outcome of the inner stage is counted and returned unchanged.
#[derive(Debug, Clone)]
pub struct GuardedStage {
    inner: Arc<dyn Stage>,
    breaker: Arc<CircuitBreaker>,
    telemetry: Telemetry,
}

impl GuardedStage {
    /// Guards `inner` with the registry's breaker for its name.
    #[must_use]
    pub fn new(inner: Arc<dyn Stage>, breakers: &CircuitBreakerRegistry, telemetry: Telemetry) -> Self {
        let breaker = breakers.get_or_create(inner.name());
        Self {
            inner,
            breaker,
            telemetry,
        }
    }

    /// The wrapped stage.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Stage> {
        &self.inner
    }

    /// The breaker guarding this stage.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Runs the inner stage under the breaker.
    pub async fn run(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let name = self.inner.name();
        self.telemetry
            .emit(StructuredEvent::info("stage_started", "stage").with_field("stage", name));

        if let Err(open) = self.breaker.try_acquire() {
            warn!(stage = %name, "Stage refused by open circuit");
            let err = FlowError::CircuitOpen(open);
            self.report_failure(name, &err);
            return Err(err);
        }

        let started = Instant::now();
        let result = self.inner.process(state).await;
        #[allow(clippy::cast_precision_loss)]
        let duration_ms = started.elapsed().as_micros() as f64 / 1000.0;

        match result {
            Ok(next) => {
                self.breaker.record_success();
                debug!(stage = %name, duration_ms, "Stage completed");
                self.telemetry
                    .metrics()
                    .record_timer("stage.duration_ms", &[("stage", name)], duration_ms);
                self.telemetry.metrics().increment("stage.completed", &[("stage", name)], 1);
                self.telemetry.emit(
                    StructuredEvent::info("stage_completed", "stage")
                        .with_field("stage", name)
                        .with_field("duration_ms", duration_ms),
                );
                Ok(next)
            }
            Err(err) => {
                self.breaker.record_failure();
                self.report_failure(name, &err);
                Err(err)
            }
        }
    }

    fn report_failure(&self, name: &str, err: &FlowError) {
        warn!(stage = %name, error = %err, "Stage failed");
        self.telemetry.metrics().increment("stage.failed", &[("stage", name)], 1);
        self.telemetry.emit(
            StructuredEvent::error("stage_failed", "stage")
                .with_field("stage", name)
                .with_field("error_type", err.kind().as_str())
                .with_field("error", err.to_string()),
        );
    }
}

#[async_trait]
impl Stage for GuardedStage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn category(&self) -> Option<StageCategory> {
        self.inner.category()
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        self.run(state).await
    }

    fn bind_tools(&self, tools: &ToolSet) -> Option<Arc<dyn Stage>> {
        self.inner.bind_tools(tools).map(|bound| {
            Arc::new(Self {
                inner: bound,
                breaker: self.breaker.clone(),
                telemetry: self.telemetry.clone(),
            }) as Arc<dyn Stage>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreakerConfig, CircuitState};
    use crate::config::BreakerSettings;
    use crate::errors::ErrorKind;
    use crate::events::CollectingEventSink;
    use crate::observability::Monitor;
    use crate::stages::FnStage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn harness() -> (CircuitBreakerRegistry, Telemetry, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let telemetry = Telemetry::new(sink.clone(), Arc::new(Monitor::new()));
        let settings = BreakerSettings::default()
            .with_override("flaky", CircuitBreakerConfig::new(2, 60.0));
        (CircuitBreakerRegistry::new(settings), telemetry, sink)
    }

    fn state() -> CodeGenerationState {
        CodeGenerationState::new("https://github.com/acme/widgets/issues/3")
    }

    #[tokio::test]
    async fn test_success_is_timed_and_counted() {
        let (breakers, telemetry, sink) = harness();
        let stage = GuardedStage::new(
            Arc::new(FnStage::new("coder", |s: CodeGenerationState| {
                Ok(s.with_code("class A {}", None, None))
            })),
            &breakers,
            telemetry.clone(),
        );

        let out = stage.run(state()).await.unwrap();
        assert_eq!(out.generated_code(), Some("class A {}"));
        assert_eq!(sink.names(), vec!["stage_started", "stage_completed"]);
        assert_eq!(telemetry.metrics().counter("stage.completed", &[("stage", "coder")]), 1);
        assert_eq!(
            telemetry
                .metrics()
                .timer_summary("stage.duration_ms", &[("stage", "coder")])
                .map(|t| t.count),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_open_breaker_skips_inner_stage() {
        let (breakers, telemetry, sink) = harness();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let stage = GuardedStage::new(
            Arc::new(FnStage::new("flaky", move |_s: CodeGenerationState| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FlowError::Timeout("slow upstream".into()))
            })),
            &breakers,
            telemetry.clone(),
        );

        for _ in 0..2 {
            let err = stage.run(state()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);
        }
        assert_eq!(stage.breaker().state(), CircuitState::Open);

        let err = stage.run(state()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let failures = sink.events_named("stage_failed");
        assert_eq!(failures.len(), 3);
        assert_eq!(
            failures[2].field("error_type").and_then(|v| v.as_str()),
            Some("circuit_open")
        );
        assert_eq!(telemetry.metrics().counter("stage.failed", &[("stage", "flaky")]), 3);
    }

    #[tokio::test]
    async fn test_guard_shares_breaker_by_name() {
        let (breakers, telemetry, _sink) = harness();
        let a = GuardedStage::new(Arc::new(FnStage::new("flaky", Ok)), &breakers, telemetry.clone());
        let b = GuardedStage::new(Arc::new(FnStage::new("flaky", Ok)), &breakers, telemetry);
        assert!(Arc::ptr_eq(a.breaker(), b.breaker()));
        assert_eq!(breakers.len(), 1);
    }
}
