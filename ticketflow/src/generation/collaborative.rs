//! The generate, cross-validate, refine loop.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::validator::refinement_directives;
use super::{CodeGenerator, CrossValidator, GeneratedCode, TestGenerator};
use crate::config::GenerationSettings;
use crate::errors::FlowResult;
use crate::events::StructuredEvent;
use crate::observability::Telemetry;
use crate::stages::{Stage, StageCategory};
use crate::state::{CodeGenerationState, ValidationResult};

/// Stage name of the collaborative generator.
pub const COLLABORATIVE_GENERATOR: &str = "collaborative_generator";

fn apply_code(state: &CodeGenerationState, generated: GeneratedCode) -> CodeGenerationState {
    state.with_code(generated.code, generated.method_name, generated.command_id)
}

/// Issues that only the tests can fix mention tests.
fn concerns_tests(issue: &str) -> bool {
    issue.to_lowercase().contains("test")
}

/// Generates code and tests together, refining both until they agree.
///
/// Each iteration's [`ValidationResult`] is appended to the state's
/// validation history. The loop stops at the first passing result or after
/// `max_iterations`, keeping the last code and tests either way; the
/// `feedback` field records `iteration_count`, the run's
/// `validation_history` and, when the budget ran out,
/// `max_iterations_exceeded`.
pub struct CollaborativeGenerator {
    code: Arc<dyn CodeGenerator>,
    tests: Arc<dyn TestGenerator>,
    validator: CrossValidator,
    max_iterations: u32,
    telemetry: Telemetry,
}

impl CollaborativeGenerator {
    /// Creates a generator with structural validation and three iterations.
    #[must_use]
    pub fn new(code: Arc<dyn CodeGenerator>, tests: Arc<dyn TestGenerator>) -> Self {
        Self {
            code,
            tests,
            validator: CrossValidator::new(),
            max_iterations: GenerationSettings::default().max_refinement_iterations,
            telemetry: Telemetry::tracing(),
        }
    }

    /// Replaces the cross-validator.
    #[must_use]
    pub fn with_validator(mut self, validator: CrossValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the iteration budget (at least one).
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Applies generation settings.
    #[must_use]
    pub fn with_settings(self, settings: &GenerationSettings) -> Self {
        self.with_max_iterations(settings.max_refinement_iterations)
    }

    /// Sets the telemetry sink.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Returns the iteration budget.
    #[must_use]
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Runs the loop on `state`.
    ///
    /// Generator errors abort the loop and propagate unchanged.
    pub async fn generate(&self, state: &CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let mut current = state.clone();
        let mut history: Vec<ValidationResult> = Vec::new();
        let mut issues: Vec<String> = Vec::new();

        for iteration in 1..=self.max_iterations {
            info!(iteration, max = self.max_iterations, "Collaborative generation iteration");
            let candidate = if iteration == 1 {
                self.initial(&current).await?
            } else {
                self.refine(&current, &issues).await?
            };

            let result = self.validator.validate(&candidate).await;
            history.push(result.clone());
            let validated = candidate.with_validation(result.clone());

            if result.success {
                self.telemetry.emit(
                    StructuredEvent::info("validation_passed", COLLABORATIVE_GENERATOR)
                        .with_field("iteration", iteration)
                        .with_field("score", result.score),
                );
                return Ok(validated.with_feedback(json!({
                    "iteration_count": iteration,
                    "validation_history": history,
                })));
            }

            self.telemetry.emit(
                StructuredEvent::warn("cross_validation_failed", COLLABORATIVE_GENERATOR)
                    .with_field("iteration", iteration)
                    .with_field("issues", result.issues.clone()),
            );
            issues = result.issues;
            current = validated;
        }

        self.telemetry.emit(
            StructuredEvent::warn("max_iterations_reached", COLLABORATIVE_GENERATOR)
                .with_field("final_iteration", self.max_iterations),
        );
        Ok(current.with_feedback(json!({
            "iteration_count": self.max_iterations,
            "validation_history": history,
            "max_iterations_exceeded": true,
        })))
    }

    async fn initial(&self, state: &CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let with_code = apply_code(state, self.code.generate(state).await?);
        debug!(
            code_len = with_code.generated_code().map_or(0, str::len),
            "Initial code generated"
        );
        let tests = self.tests.generate(&with_code).await?;
        Ok(with_code.with_tests(tests))
    }

    /// Tests are always regenerated; code only when some issue is not about
    /// the tests.
    async fn refine(
        &self,
        state: &CodeGenerationState,
        issues: &[String],
    ) -> FlowResult<CodeGenerationState> {
        let directives = refinement_directives(issues);
        let mut next = state.clone();
        if issues.iter().any(|issue| !concerns_tests(issue)) {
            next = apply_code(&next, self.code.refine(state, &directives).await?);
        }
        let tests = self.tests.refine(&next, &directives).await?;
        Ok(next.with_tests(tests))
    }
}

impl std::fmt::Debug for CollaborativeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborativeGenerator")
            .field("validator", &self.validator)
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for CollaborativeGenerator {
    fn name(&self) -> &str {
        COLLABORATIVE_GENERATOR
    }

    fn category(&self) -> Option<StageCategory> {
        Some(StageCategory::CodeGenerator)
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        self.generate(&state).await
    }
}
