//! Stage and probe doubles.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::{FlowError, FlowResult};
use crate::health::HealthProbe;
use crate::stages::{Stage, StageCategory};
use crate::state::CodeGenerationState;

/// Annotation that [`RecordingStage`] appends its name to.
pub const EXECUTION_ORDER: &str = "execution_order";

/// A mock stage that records calls and returns a configurable result.
///
/// Succeeds by default, writing the configured annotations onto its input.
#[derive(Debug)]
pub struct MockStage {
    name: String,
    category: Option<StageCategory>,
    annotations: Mutex<Vec<(String, Value)>>,
    error: Mutex<Option<FlowError>>,
    inputs: Mutex<Vec<CodeGenerationState>>,
}

impl MockStage {
    /// Creates a new passing mock stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            annotations: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Sets the recovery category.
    #[must_use]
    pub fn with_category(mut self, category: StageCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Adds an annotation written on success.
    #[must_use]
    pub fn with_output(self, key: impl Into<String>, value: Value) -> Self {
        self.annotations.lock().push((key.into(), value));
        self
    }

    /// Makes every later call fail with `error`.
    pub fn set_error(&self, error: FlowError) {
        *self.error.lock() = Some(error);
    }

    /// Makes later calls succeed again.
    pub fn clear_error(&self) {
        *self.error.lock() = None;
    }

    /// Returns the number of times the stage was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Returns the state received by each call.
    #[must_use]
    pub fn recorded_inputs(&self) -> Vec<CodeGenerationState> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Option<StageCategory> {
        self.category
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        self.inputs.lock().push(state.clone());
        if let Some(err) = self.error.lock().clone() {
            return Err(err);
        }
        Ok(self
            .annotations
            .lock()
            .iter()
            .fold(state, |s, (key, value)| s.with_annotation(key.clone(), value.clone())))
    }
}

/// Fails a fixed number of times, then passes its input through.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    category: Option<StageCategory>,
    error: FlowError,
    failures: usize,
    attempts: AtomicUsize,
}

impl FailingStage {
    /// Creates a stage that always fails with `error`.
    #[must_use]
    pub fn new(name: impl Into<String>, error: FlowError) -> Self {
        Self::times(name, error, usize::MAX)
    }

    /// Creates a stage failing `failures` times before succeeding.
    #[must_use]
    pub fn times(name: impl Into<String>, error: FlowError, failures: usize) -> Self {
        Self {
            name: name.into(),
            category: None,
            error,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Sets the recovery category.
    #[must_use]
    pub fn with_category(mut self, category: StageCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Option<StageCategory> {
        self.category
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(self.error.clone())
        } else {
            Ok(state)
        }
    }
}

/// A stage that takes time to execute.
#[derive(Debug)]
pub struct SlowStage {
    name: String,
    delay: Duration,
}

impl SlowStage {
    /// Creates a new slow stage.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }

    /// Creates a slow stage with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        tokio::time::sleep(self.delay).await;
        Ok(state)
    }
}

/// Appends its name to the [`EXECUTION_ORDER`] annotation.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
}

impl RecordingStage {
    /// Creates a new recording stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The names recorded in `state`, in execution order.
    #[must_use]
    pub fn order(state: &CodeGenerationState) -> Vec<String> {
        state
            .annotation(EXECUTION_ORDER)
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let mut order = Self::order(&state);
        order.push(self.name.clone());
        Ok(state.with_annotation(EXECUTION_ORDER, Value::from(order)))
    }
}

/// Writes one annotation.
#[derive(Debug)]
pub struct FieldStage {
    name: String,
    key: String,
    value: Value,
}

impl FieldStage {
    /// Creates a stage writing `key = value`.
    #[must_use]
    pub fn new(name: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            value,
        }
    }
}

#[async_trait]
impl Stage for FieldStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        Ok(state.with_annotation(self.key.clone(), self.value.clone()))
    }
}

/// A health probe with a settable answer that counts its checks.
#[derive(Debug)]
pub struct StaticProbe {
    healthy: AtomicBool,
    checks: AtomicUsize,
}

impl StaticProbe {
    /// Creates a probe answering `healthy`.
    #[must_use]
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            checks: AtomicUsize::new(0),
        }
    }

    /// Changes the answer.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Returns how often the probe ran.
    #[must_use]
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn check(&self) -> FlowResult<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}
