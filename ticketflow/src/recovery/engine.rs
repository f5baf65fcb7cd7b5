//! The error recovery engine.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backoff::{RetryConfig, RetryState};
use super::catalog::{salvage_state, RecoveryProfile};
use super::strategy::{classify, RecoveryStrategy};
use crate::circuit::{BreakerStatus, CircuitBreaker, CircuitBreakerRegistry};
use crate::errors::{ErrorKind, FlowError, FlowResult};
use crate::events::StructuredEvent;
use crate::health::{HealthMonitor, ServiceStatus};
use crate::observability::Telemetry;
use crate::registry::ServiceRegistry;
use crate::stages::{Stage, StageCategory};
use crate::state::{keys, CodeGenerationState, StateMap};

/// Name of the breaker wrapping every recovery call.
pub const RECOVERY_BREAKER: &str = "error_recovery";

const COMPONENT: &str = "error_recovery";

/// A stage failure routed to the engine.
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// Name of the failed stage (a stage category name).
    pub stage: String,
    /// The triggering error.
    pub error: FlowError,
    /// Free-form context.
    pub context: Map<String, Value>,
}

impl FailureReport {
    /// Creates a report.
    #[must_use]
    pub fn new(stage: impl Into<String>, error: FlowError) -> Self {
        Self {
            stage: stage.into(),
            error,
            context: Map::new(),
        }
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Writes the failure-signaling keys into the mapping form of `state`.
    pub fn attach(&self, state: &CodeGenerationState) -> FlowResult<StateMap> {
        let mut map = state.to_mapping()?;
        map.insert(keys::FAILED_STAGE.into(), Value::String(self.stage.clone()));
        map.insert(keys::ERROR_CONTEXT.into(), Value::Object(self.context.clone()));
        map.insert(keys::ORIGINAL_ERROR.into(), Value::Object(self.error.to_dict()));
        Ok(map)
    }
}

/// Outcome of one recovery call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// The failed stage.
    pub stage: String,
    /// Strategy that succeeded, or the last one tried.
    pub strategy: Option<RecoveryStrategy>,
    /// Total attempts across the chain.
    pub attempts: u32,
    /// Whether recovery succeeded.
    pub success: bool,
    /// Why recovery failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the call finished.
    pub timestamp: DateTime<Utc>,
}

impl RecoveryRecord {
    fn details(&self) -> Value {
        let mut details = json!({
            "strategy": self.strategy.map(RecoveryStrategy::as_str),
            "attempts": self.attempts,
            "success": self.success,
        });
        if let (Some(error), Value::Object(map)) = (&self.error, &mut details) {
            map.insert("error".into(), Value::String(error.clone()));
        }
        details
    }
}

/// Observable state of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatus {
    /// Every breaker in the shared registry.
    pub circuit_breakers: BTreeMap<String, BreakerStatus>,
    /// Every monitored service.
    pub service_health: BTreeMap<String, ServiceStatus>,
    /// Most recent recovery calls, oldest first.
    pub recovery_history: Vec<RecoveryRecord>,
}

struct LinkOutcome {
    attempts: u32,
    result: FlowResult<CodeGenerationState>,
}

/// Classifies stage failures and runs recovery strategy chains.
///
/// Strategy selection, in order:
/// 1. A kind listed in the failed category's common failures enters the
///    full chain at RETRY.
/// 2. Otherwise the classification table picks a strategy. STATE_RECOVERY
///    runs alone; any other strategy starts the chain at its own position.
///
/// The chain is RETRY, FALLBACK, DEGRADATION, SKIP, SUBSTITUTE and stops at
/// the first success.
pub struct ErrorRecoveryEngine {
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthMonitor>,
    breaker: Arc<CircuitBreaker>,
    telemetry: Telemetry,
    retry: RetryConfig,
    history_limit: usize,
    history: Mutex<VecDeque<RecoveryRecord>>,
    retry_targets: HashMap<StageCategory, Arc<dyn Stage>>,
}

impl ErrorRecoveryEngine {
    /// Creates an engine sharing the registry's breakers and health monitor.
    #[must_use]
    pub fn new(registry: &ServiceRegistry) -> Self {
        let settings = &registry.config().recovery;
        Self {
            breakers: registry.breakers().clone(),
            health: registry.health().clone(),
            breaker: registry.breaker(RECOVERY_BREAKER),
            telemetry: registry.telemetry().clone(),
            retry: settings.retry.clone(),
            history_limit: settings.history_limit,
            history: Mutex::new(VecDeque::new()),
            retry_targets: HashMap::new(),
        }
    }

    /// Overrides the delay policy between retry attempts.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Registers the stage RETRY re-runs for a category.
    ///
    /// Without a target, a retry attempt succeeds as soon as the category's
    /// dependent services are healthy.
    #[must_use]
    pub fn with_retry_target(mut self, category: StageCategory, stage: Arc<dyn Stage>) -> Self {
        self.retry_targets.insert(category, stage);
        self
    }

    /// The breaker wrapping recovery calls.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Recovers a failed state given in mapping form.
    ///
    /// The mapping must carry `failed_stage` and `original_error`; without
    /// them it is returned unchanged. The result carries either
    /// `recovery_applied` or `recovery_failed` plus `recovery_details`, and
    /// never the failure-signaling keys.
    ///
    /// Fails with [`FlowError::CircuitOpen`] while the recovery breaker is
    /// open.
    pub async fn recover(&self, failed: StateMap) -> FlowResult<StateMap> {
        let stage = failed
            .get(keys::FAILED_STAGE)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let original_error = failed
            .get(keys::ORIGINAL_ERROR)
            .filter(|v| !v.is_null())
            .cloned();
        let (Some(stage), Some(original_error)) = (stage, original_error) else {
            warn!("Recovery requested without failed stage or original error");
            self.telemetry.emit(
                StructuredEvent::warn("recovery_invalid_state", COMPONENT)
                    .with_field("has_failed_stage", failed.contains_key(keys::FAILED_STAGE))
                    .with_field("has_original_error", failed.contains_key(keys::ORIGINAL_ERROR)),
            );
            return Ok(failed);
        };

        let (kind, message) = describe_error(&original_error);
        let mut stripped = failed;
        for key in [keys::FAILED_STAGE, keys::ERROR_CONTEXT, keys::ORIGINAL_ERROR] {
            stripped.remove(key);
        }

        // Unknown stages never reach the breaker.
        let Some(category) = StageCategory::parse(&stage) else {
            let record = self.record(&stage, None, 0, Some(format!("unknown stage category '{stage}'")));
            self.emit_failed(&record);
            return Ok(finish(stripped, &record));
        };
        let profile = RecoveryProfile::for_category(category);

        self.breaker.try_acquire()?;

        self.telemetry.emit(
            StructuredEvent::info("recovery_started", COMPONENT)
                .with_field("stage", stage.as_str())
                .with_field("error_type", kind.as_str()),
        );
        info!(stage = %stage, error_type = %kind, "Starting recovery");

        let chain = select_chain(profile, kind);
        let (record, recovered) = match (chain, CodeGenerationState::from_mapping(&stripped)) {
            (Some(chain), Ok(state)) => self.run(profile, chain, &message, state).await,
            // State recovery always starts over from the salvageable fragments.
            (None, _) => self.state_recovery(&stage, salvage_state(&stripped), kind),
            // A state that no longer deserializes is itself a state error.
            (Some(_), Err(err)) => {
                debug!(error = %err, "Failed state does not deserialize");
                self.state_recovery(&stage, salvage_state(&stripped), kind)
            }
        };

        if record.success {
            self.breaker.record_success();
            self.telemetry.emit(
                StructuredEvent::info("recovery_success", COMPONENT)
                    .with_field("stage", stage.as_str())
                    .with_field("strategy", record.strategy.map(RecoveryStrategy::as_str))
                    .with_field("attempts", record.attempts),
            );
        } else {
            self.breaker.record_failure();
            self.emit_failed(&record);
        }

        let base = match recovered {
            Some(state) => state.to_mapping()?,
            None => stripped,
        };
        Ok(finish(base, &record))
    }

    /// Typed convenience over [`Self::recover`].
    pub async fn recover_failure(
        &self,
        state: &CodeGenerationState,
        report: &FailureReport,
    ) -> FlowResult<CodeGenerationState> {
        let recovered = self.recover(report.attach(state)?).await?;
        CodeGenerationState::from_mapping(&recovered)
    }

    /// Breaker statuses, service health and the latest recovery records.
    #[must_use]
    pub fn recovery_status(&self) -> RecoveryStatus {
        RecoveryStatus {
            circuit_breakers: self.breakers.statuses(),
            service_health: self.health.get_service_status(),
            recovery_history: self.history.lock().iter().cloned().collect(),
        }
    }

    async fn run(
        &self,
        profile: &RecoveryProfile,
        chain: &'static [RecoveryStrategy],
        message: &str,
        state: CodeGenerationState,
    ) -> (RecoveryRecord, Option<CodeGenerationState>) {
        let stage = profile.category.as_str();
        debug!(stage, error = %message, chain = ?chain, "Recovery chain selected");

        let mut attempts = 0;
        let mut last_error = None;
        for strategy in chain {
            let outcome = match strategy {
                RecoveryStrategy::Retry => self.retry(profile, &state).await,
                other => LinkOutcome {
                    attempts: 1,
                    result: profile.apply(*other, &state),
                },
            };
            attempts += outcome.attempts;
            match outcome.result {
                Ok(recovered) => {
                    let record = self.record(stage, Some(*strategy), attempts, None);
                    return (record, Some(recovered));
                }
                Err(err) => {
                    debug!(stage, strategy = %strategy, error = %err, "Recovery strategy failed");
                    last_error = Some(err.to_string());
                }
            }
        }

        let error = last_error.map_or_else(
            || "no recovery strategy applies".to_string(),
            |e| format!("all recovery strategies exhausted: {e}"),
        );
        let record = self.record(stage, chain.last().copied(), attempts, Some(error));
        (record, None)
    }

    async fn retry(&self, profile: &RecoveryProfile, state: &CodeGenerationState) -> LinkOutcome {
        let target = self.retry_targets.get(&profile.category);
        let mut backoff = RetryState::new();
        let mut attempts = 0;
        let mut last_error = FlowError::Internal("no retry attempted".into());

        while attempts < profile.max_retries {
            attempts += 1;

            if let Some(service) = self.first_unhealthy(profile).await {
                last_error = FlowError::ServiceUnavailable {
                    service: service.to_string(),
                    message: "dependent service unhealthy".to_string(),
                };
            } else {
                if attempts > 1 {
                    tokio::time::sleep(backoff.next_delay(&self.retry)).await;
                }
                match target {
                    None => {
                        return LinkOutcome {
                            attempts,
                            result: Ok(state.clone()),
                        }
                    }
                    Some(stage) => match stage.process(state.clone()).await {
                        Ok(recovered) => {
                            return LinkOutcome {
                                attempts,
                                result: Ok(recovered),
                            }
                        }
                        Err(err) => last_error = err,
                    },
                }
            }

            self.telemetry.emit(
                StructuredEvent::warn("retry_attempt_failed", COMPONENT)
                    .with_field("stage", profile.category.as_str())
                    .with_field("attempt", attempts)
                    .with_field("error", last_error.to_string()),
            );
        }

        LinkOutcome {
            attempts,
            result: Err(last_error),
        }
    }

    /// Returns the first dependent service reported unhealthy. Services
    /// without a registered probe do not block a retry.
    async fn first_unhealthy(&self, profile: &RecoveryProfile) -> Option<&'static str> {
        for service in profile.dependent_services {
            if self.health.is_registered(service) && !self.health.is_service_healthy(service).await
            {
                return Some(*service);
            }
        }
        None
    }

    fn state_recovery(
        &self,
        stage: &str,
        base: CodeGenerationState,
        kind: ErrorKind,
    ) -> (RecoveryRecord, Option<CodeGenerationState>) {
        let recovered = base
            .with_annotation(keys::STATE_RECOVERED, Value::Bool(true))
            .with_annotation(keys::ORIGINAL_ERROR_TYPE, Value::String(kind.as_str().into()))
            .with_annotation(keys::RECOVERY_TIMESTAMP, Value::String(Utc::now().to_rfc3339()));
        self.telemetry.emit(
            StructuredEvent::info("state_recovery_success", COMPONENT)
                .with_field("stage", stage)
                .with_field("error_type", kind.as_str()),
        );
        let record = self.record(stage, Some(RecoveryStrategy::StateRecovery), 1, None);
        (record, Some(recovered))
    }

    fn record(
        &self,
        stage: &str,
        strategy: Option<RecoveryStrategy>,
        attempts: u32,
        error: Option<String>,
    ) -> RecoveryRecord {
        let record = RecoveryRecord {
            stage: stage.to_string(),
            strategy,
            attempts,
            success: error.is_none(),
            error,
            timestamp: Utc::now(),
        };
        let mut history = self.history.lock();
        history.push_back(record.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        record
    }

    fn emit_failed(&self, record: &RecoveryRecord) {
        warn!(stage = %record.stage, attempts = record.attempts, "Recovery failed");
        self.telemetry.emit(
            StructuredEvent::error("recovery_failed", COMPONENT)
                .with_field("stage", record.stage.as_str())
                .with_field("final_strategy", record.strategy.map(RecoveryStrategy::as_str))
                .with_field("total_attempts", record.attempts)
                .with_field("error", record.error.clone().unwrap_or_default()),
        );
    }
}

impl std::fmt::Debug for ErrorRecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRecoveryEngine")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("retry_targets", &self.retry_targets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// The chain to run for `kind` failing in `profile`'s stage, or `None` when
/// the state itself must be rebuilt.
///
/// A routine failure of the stage enters the chain at RETRY; otherwise the
/// classification table picks the entry point.
fn select_chain(profile: &RecoveryProfile, kind: ErrorKind) -> Option<&'static [RecoveryStrategy]> {
    if profile.is_common_failure(kind) {
        return Some(RecoveryStrategy::Retry.chain_from());
    }
    match classify(kind) {
        RecoveryStrategy::StateRecovery => None,
        other => Some(other.chain_from()),
    }
}

/// Reads the kind and message from an `original_error` value.
///
/// Accepts the `{type, message}` diagnostic mapping or a bare kind name.
fn describe_error(value: &Value) -> (ErrorKind, String) {
    match value {
        Value::Object(map) => {
            let kind = map
                .get("type")
                .and_then(Value::as_str)
                .and_then(ErrorKind::parse)
                .unwrap_or(ErrorKind::Internal);
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (kind, message)
        }
        Value::String(name) => (ErrorKind::parse(name).unwrap_or(ErrorKind::Internal), name.clone()),
        other => (ErrorKind::Internal, other.to_string()),
    }
}

fn finish(mut map: StateMap, record: &RecoveryRecord) -> StateMap {
    let flag = if record.success {
        keys::RECOVERY_APPLIED
    } else {
        keys::RECOVERY_FAILED
    };
    map.remove(keys::RECOVERY_APPLIED);
    map.remove(keys::RECOVERY_FAILED);
    map.insert(flag.into(), Value::Bool(true));
    map.insert(keys::RECOVERY_DETAILS.into(), record.details());
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreakerConfig, CircuitState};
    use crate::config::{BreakerSettings, FlowConfig};
    use crate::errors::ValidationError;
    use crate::events::CollectingEventSink;
    use crate::health::FnProbe;
    use crate::observability::Monitor;
    use crate::recovery::{BackoffStrategy, JitterStrategy};
    use crate::stages::FnStage;
    use crate::state::ValidationResult;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    const URL: &str = "https://github.com/acme/widgets/issues/21";

    fn registry() -> (ServiceRegistry, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let telemetry = Telemetry::new(sink.clone(), Arc::new(Monitor::new()));
        let mut config = FlowConfig::default();
        config.recovery.retry = RetryConfig::immediate();
        config.health.cache_ttl_secs = 0.0;
        (ServiceRegistry::with_telemetry(config, telemetry), sink)
    }

    fn state() -> CodeGenerationState {
        CodeGenerationState::new(URL)
            .with_ticket_content("Export widgets")
            .with_code("export class Real {}", None, None)
    }

    fn details(map: &StateMap) -> &Value {
        &map[keys::RECOVERY_DETAILS]
    }

    #[tokio::test]
    async fn test_missing_failure_keys_return_state_unchanged() {
        let (registry, sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);
        let map = state().to_mapping().unwrap();

        let out = engine.recover(map.clone()).await.unwrap();
        assert_eq!(out, map);
        assert_eq!(sink.names(), vec!["recovery_invalid_state"]);

        let mut only_stage = map.clone();
        only_stage.insert(keys::FAILED_STAGE.into(), json!("code_generator"));
        assert_eq!(engine.recover(only_stage.clone()).await.unwrap(), only_stage);
    }

    #[tokio::test]
    async fn test_retry_recovers_when_services_healthy() {
        let (registry, _sink) = registry();
        registry.register_service("code_service", Arc::new(FnProbe::new(|| true)));
        registry.register_service("compiler", Arc::new(FnProbe::new(|| true)));
        let engine = ErrorRecoveryEngine::new(&registry);

        let report = FailureReport::new("code_generator", FlowError::Timeout("slow model".into()))
            .with_context("service", "code_service");
        let out = engine.recover(report.attach(&state()).unwrap()).await.unwrap();

        assert_eq!(out[keys::RECOVERY_APPLIED], json!(true));
        assert_eq!(details(&out), &json!({"strategy": "RETRY", "attempts": 1, "success": true}));
        for key in [keys::FAILED_STAGE, keys::ERROR_CONTEXT, keys::ORIGINAL_ERROR] {
            assert!(!out.contains_key(key), "{key} should be stripped");
        }
        assert_eq!(out[keys::GENERATED_CODE], json!("export class Real {}"));
    }

    #[tokio::test]
    async fn test_unhealthy_services_exhaust_retries_then_fall_back() {
        let (registry, sink) = registry();
        let probes = Arc::new(AtomicU32::new(0));
        let counter = probes.clone();
        registry.register_service(
            "code_service",
            Arc::new(FnProbe::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })),
        );
        let engine = ErrorRecoveryEngine::new(&registry);

        let report = FailureReport::new("code_generator", FlowError::Timeout("slow".into()));
        let out = engine.recover_failure(&state(), &report).await.unwrap();

        assert!(out.is_flagged(keys::RECOVERY_APPLIED));
        let details = out.annotation(keys::RECOVERY_DETAILS).unwrap();
        assert_eq!(details["strategy"], "FALLBACK");
        assert_eq!(details["attempts"], 3);
        assert!(out.generated_code().unwrap().contains("FallbackImplementation"));
        assert_eq!(probes.load(Ordering::SeqCst), 2);
        assert_eq!(sink.events_named("retry_attempt_failed").len(), 2);
    }

    #[tokio::test]
    async fn test_retry_reruns_registered_target() {
        let (registry, _sink) = registry();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let target = FnStage::new("code_generator", move |s: CodeGenerationState| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(FlowError::Timeout("again".into()))
            } else {
                Ok(s.with_code("export class Retried {}", None, None))
            }
        });
        let engine = ErrorRecoveryEngine::new(&registry)
            .with_retry_target(StageCategory::CodeGenerator, Arc::new(target));

        let report = FailureReport::new("code_generator", FlowError::Timeout("slow".into()));
        let out = engine.recover_failure(&state(), &report).await.unwrap();

        assert_eq!(out.generated_code(), Some("export class Retried {}"));
        assert_eq!(out.annotation(keys::RECOVERY_DETAILS).unwrap()["attempts"], 2);
    }

    #[tokio::test]
    async fn test_common_failure_overrides_classification() {
        let (registry, _sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);

        // Validation is routine for code generation, so RETRY runs first even
        // though the table maps validation to SUBSTITUTE.
        let error = FlowError::Validation(ValidationError::new("bad output"));
        let report = FailureReport::new("code_generator", error.clone());
        let out = engine.recover_failure(&state(), &report).await.unwrap();
        assert_eq!(out.annotation(keys::RECOVERY_DETAILS).unwrap()["strategy"], "RETRY");

        // Not routine for code review: the table applies.
        let report = FailureReport::new("code_reviewer", error);
        let out = engine.recover_failure(&state(), &report).await.unwrap();
        assert_eq!(out.annotation(keys::RECOVERY_DETAILS).unwrap()["strategy"], "SUBSTITUTE");
        assert!(out.is_flagged(keys::SUBSTITUTED));
    }

    #[tokio::test]
    async fn test_circuit_open_degrades() {
        let (registry, _sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);
        let open = crate::errors::CircuitBreakerOpenError::new("compiler", None);

        let report = FailureReport::new("test_generator", FlowError::CircuitOpen(open));
        let out = engine
            .recover_failure(&state().with_tests("describe()"), &report)
            .await
            .unwrap();

        assert_eq!(out.annotation(keys::RECOVERY_DETAILS).unwrap()["strategy"], "DEGRADATION");
        assert_eq!(out.generated_tests(), None);
        assert_eq!(out.annotation(keys::DEGRADED_FEATURES), Some(&json!(["test_generation"])));
    }

    #[tokio::test]
    async fn test_skip_and_routine_fallback_paths() {
        let (registry, _sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);
        let report = FailureReport::new("code_integrator", FlowError::Internal("boom".into()));
        let out = engine.recover_failure(&state(), &report).await.unwrap();
        assert_eq!(out.annotation(keys::RECOVERY_DETAILS).unwrap()["strategy"], "SKIP");

        let open = crate::errors::CircuitBreakerOpenError::new("ticket_source", None);
        let report = FailureReport::new("fetch_issue", FlowError::CircuitOpen(open));
        registry.register_service("ticket_source", Arc::new(FnProbe::new(|| false)));
        let out = engine.recover_failure(&state(), &report).await.unwrap();
        // Routine for fetch_issue: RETRY x3, FALLBACK succeeds.
        let details = out.annotation(keys::RECOVERY_DETAILS).unwrap();
        assert_eq!(details["strategy"], "FALLBACK");
        assert_eq!(details["attempts"], 4);
    }

    #[tokio::test]
    async fn test_state_recovery_is_terminal() {
        let (registry, sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);
        let report = FailureReport::new("ticket_clarity", FlowError::KeyAccess("ticket".into()));

        let out = engine.recover(report.attach(&state()).unwrap()).await.unwrap();

        assert_eq!(out[keys::STATE_RECOVERED], json!(true));
        assert_eq!(out[keys::ORIGINAL_ERROR_TYPE], json!("key_access"));
        assert!(out.contains_key(keys::RECOVERY_TIMESTAMP));
        assert_eq!(details(&out)["strategy"], "STATE_RECOVERY");
        assert_eq!(details(&out)["attempts"], 1);
        assert_eq!(out[keys::URL], json!(URL));
        assert_eq!(out[keys::GENERATED_CODE], json!("export class Real {}"));
        assert_eq!(sink.events_named("state_recovery_success").len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_state_is_salvaged() {
        let (registry, _sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);
        let failed = json!({
            "url": URL,
            "validation_history": "not a list",
            "failed_stage": "code_generator",
            "original_error": {"type": "timeout", "message": "slow"}
        });

        let out = engine
            .recover(failed.as_object().unwrap().clone())
            .await
            .unwrap();
        assert_eq!(out[keys::STATE_RECOVERED], json!(true));
        assert_eq!(out[keys::URL], json!(URL));
        assert_eq!(out[keys::VALIDATION_HISTORY], json!([]));
    }

    #[tokio::test]
    async fn test_unknown_stage_marks_recovery_failed() {
        let (registry, _sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);
        let report = FailureReport::new("mystery_stage", FlowError::Timeout("x".into()));

        let out = engine.recover(report.attach(&state()).unwrap()).await.unwrap();
        assert_eq!(out[keys::RECOVERY_FAILED], json!(true));
        assert_eq!(details(&out)["success"], json!(false));
        assert!(!out.contains_key(keys::FAILED_STAGE));
    }

    #[tokio::test]
    async fn test_state_recovery_starts_from_salvaged_fragments() {
        let (registry, _sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);
        let report = FailureReport::new("ticket_clarity", FlowError::KeyAccess("ticket".into()));
        let failed = state()
            .with_code("export class Real {}", Some("run".into()), None)
            .with_validation(ValidationResult::passed(90))
            .with_annotation("unrelated_marker", json!(true));

        let out = engine.recover_failure(&failed, &report).await.unwrap();

        assert!(out.is_flagged(keys::STATE_RECOVERED));
        assert_eq!(out.issue_url(), URL);
        assert_eq!(out.ticket_content(), "Export widgets");
        assert_eq!(out.generated_code(), Some("export class Real {}"));
        assert_eq!(out.method_name(), None);
        assert!(out.validation_history().is_empty());
        assert_eq!(out.annotation("unrelated_marker"), None);
        // Only the three recovery markers were written onto the fresh state.
        assert_eq!(out.get_audit_trail().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_stage_does_not_touch_recovery_breaker() {
        let sink = Arc::new(CollectingEventSink::new());
        let telemetry = Telemetry::new(sink.clone(), Arc::new(Monitor::new()));
        let mut config = FlowConfig::default();
        config.breakers = BreakerSettings::default()
            .with_override(RECOVERY_BREAKER, CircuitBreakerConfig::new(1, 60.0));
        let registry = ServiceRegistry::with_telemetry(config, telemetry);
        let engine = ErrorRecoveryEngine::new(&registry);
        engine.breaker().record_failure();

        let report = FailureReport::new("mystery_stage", FlowError::Timeout("x".into()));
        let out = engine.recover(report.attach(&state()).unwrap()).await.unwrap();

        assert_eq!(out[keys::RECOVERY_FAILED], json!(true));
        assert_eq!(engine.breaker().state(), CircuitState::Open);
        assert_eq!(engine.breaker().failure_count(), 1);
        assert!(sink.events_named("recovery_started").is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_services_fail_fast_without_backoff() {
        let (registry, _sink) = registry();
        registry.register_service("code_service", Arc::new(FnProbe::new(|| false)));
        let engine = ErrorRecoveryEngine::new(&registry).with_retry_config(
            RetryConfig::new()
                .with_base_delay_ms(5_000)
                .with_backoff(BackoffStrategy::Constant)
                .with_jitter(JitterStrategy::None),
        );

        let report = FailureReport::new("code_generator", FlowError::Timeout("slow".into()));
        let started = std::time::Instant::now();
        let out = engine.recover_failure(&state(), &report).await.unwrap();

        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(out.annotation(keys::RECOVERY_DETAILS).unwrap()["strategy"], "FALLBACK");
    }

    #[tokio::test]
    async fn test_open_recovery_breaker_refuses() {
        let sink = Arc::new(CollectingEventSink::new());
        let telemetry = Telemetry::new(sink, Arc::new(Monitor::new()));
        let mut config = FlowConfig::default();
        config.breakers = BreakerSettings::default()
            .with_override(RECOVERY_BREAKER, CircuitBreakerConfig::new(1, 60.0));
        let registry = ServiceRegistry::with_telemetry(config, telemetry);
        let engine = ErrorRecoveryEngine::new(&registry);

        engine.breaker().record_failure();
        assert_eq!(engine.breaker().state(), CircuitState::Open);

        let report = FailureReport::new("code_generator", FlowError::Timeout("x".into()));
        let err = engine
            .recover(report.attach(&state()).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[tokio::test]
    async fn test_status_keeps_recent_records() {
        let (registry, _sink) = registry();
        let engine = ErrorRecoveryEngine::new(&registry);
        for _ in 0..12 {
            let report = FailureReport::new("code_reviewer", FlowError::Internal("x".into()));
            engine.recover_failure(&state(), &report).await.unwrap();
        }

        let status = engine.recovery_status();
        assert_eq!(status.recovery_history.len(), 10);
        assert!(status.recovery_history.iter().all(|r| r.success));
        assert!(status.circuit_breakers.contains_key(RECOVERY_BREAKER));
        assert!(serde_json::to_value(&status).is_ok());
    }

    #[test]
    fn test_describe_error() {
        assert_eq!(
            describe_error(&json!({"type": "network", "message": "reset"})),
            (ErrorKind::Connection, "reset".to_string())
        );
        assert_eq!(describe_error(&json!("timeout")).0, ErrorKind::Timeout);
        assert_eq!(describe_error(&json!(42)).0, ErrorKind::Internal);
    }
}
