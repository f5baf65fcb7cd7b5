//! Generators and judge backed by a [`ReasoningService`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::{CodeGenerator, GeneratedCode, TestGenerator, ValidationJudge};
use crate::errors::{FlowError, FlowResult};
use crate::stages::{parse_json_answer, ReasoningService};
use crate::state::{CodeGenerationState, ValidationResult};

/// Score given to a verdict that could not be read.
const UNPARSEABLE_VERDICT_SCORE: u8 = 30;

/// Removes a surrounding markdown code fence, if any.
fn strip_fences(answer: &str) -> &str {
    let trimmed = answer.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn non_empty(text: &str, what: &str) -> FlowResult<String> {
    if text.trim().is_empty() {
        Err(FlowError::Llm(format!("reasoning service returned no {what}")))
    } else {
        Ok(text.to_string())
    }
}

fn ticket_summary(state: &CodeGenerationState) -> String {
    match state.ticket() {
        Some(ticket) => format!(
            "Title: {}\nDescription: {}\nSteps:\n{}",
            ticket.title,
            ticket.description,
            ticket.implementation_steps.join("\n")
        ),
        None => state.ticket_content().to_string(),
    }
}

fn context_files(state: &CodeGenerationState) -> String {
    state
        .relevant_code_files()
        .iter()
        .map(|f| format!("// {}\n{}", f.path, f.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Writes code through a reasoning service.
///
/// The service may answer with `{code, method_name, command_id}` JSON or with
/// bare (optionally fenced) code.
pub struct ReasoningCodeGenerator {
    reasoning: Arc<dyn ReasoningService>,
}

impl ReasoningCodeGenerator {
    /// Creates the generator.
    #[must_use]
    pub fn new(reasoning: Arc<dyn ReasoningService>) -> Self {
        Self { reasoning }
    }

    async fn ask(&self, prompt: &str) -> FlowResult<GeneratedCode> {
        let answer = self.reasoning.invoke(prompt).await?;
        if let Ok(Value::Object(map)) = parse_json_answer(&answer) {
            if let Some(code) = map.get("code").and_then(Value::as_str) {
                let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
                return Ok(GeneratedCode {
                    code: non_empty(code, "code")?,
                    method_name: text("method_name"),
                    command_id: text("command_id"),
                });
            }
        }
        Ok(GeneratedCode::new(non_empty(strip_fences(&answer), "code")?))
    }
}

impl std::fmt::Debug for ReasoningCodeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningCodeGenerator").finish_non_exhaustive()
    }
}

#[async_trait]
impl CodeGenerator for ReasoningCodeGenerator {
    async fn generate(&self, state: &CodeGenerationState) -> FlowResult<GeneratedCode> {
        let spec = state.code_spec();
        let prompt = format!(
            "Write {} code for this ticket. Answer with JSON {{code, method_name, command_id}}.\n\n{}\n\nExisting code:\n{}",
            spec.language,
            ticket_summary(state),
            context_files(state),
        );
        self.ask(&prompt).await
    }

    async fn refine(
        &self,
        state: &CodeGenerationState,
        directives: &[String],
    ) -> FlowResult<GeneratedCode> {
        let prompt = format!(
            "Revise the code. Answer with JSON {{code, method_name, command_id}}.\n\nInstructions:\n{}\n\nCode:\n{}",
            directives.join("\n"),
            state.generated_code().unwrap_or_default(),
        );
        self.ask(&prompt).await
    }
}

/// Writes tests through a reasoning service.
pub struct ReasoningTestGenerator {
    reasoning: Arc<dyn ReasoningService>,
}

impl ReasoningTestGenerator {
    /// Creates the generator.
    #[must_use]
    pub fn new(reasoning: Arc<dyn ReasoningService>) -> Self {
        Self { reasoning }
    }
}

impl std::fmt::Debug for ReasoningTestGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningTestGenerator").finish_non_exhaustive()
    }
}

#[async_trait]
impl TestGenerator for ReasoningTestGenerator {
    async fn generate(&self, state: &CodeGenerationState) -> FlowResult<String> {
        let spec = state.test_spec();
        let prompt = format!(
            "Write {} {} tests using describe and it blocks for:\n{}",
            spec.framework,
            spec.test_type,
            state.generated_code().unwrap_or_default(),
        );
        let answer = self.reasoning.invoke(&prompt).await?;
        non_empty(strip_fences(&answer), "tests")
    }

    async fn refine(
        &self,
        state: &CodeGenerationState,
        directives: &[String],
    ) -> FlowResult<String> {
        let prompt = format!(
            "Revise the tests.\n\nInstructions:\n{}\n\nCode:\n{}\n\nTests:\n{}",
            directives.join("\n"),
            state.generated_code().unwrap_or_default(),
            state.generated_tests().unwrap_or_default(),
        );
        let answer = self.reasoning.invoke(&prompt).await?;
        non_empty(strip_fences(&answer), "tests")
    }
}

/// Asks a reasoning service whether code and tests are aligned.
///
/// Expects `{passed, score, issues, recommendations}` JSON. An answer that
/// cannot be read is a failing verdict, not an error.
pub struct ReasoningJudge {
    reasoning: Arc<dyn ReasoningService>,
}

impl ReasoningJudge {
    /// Creates the judge.
    #[must_use]
    pub fn new(reasoning: Arc<dyn ReasoningService>) -> Self {
        Self { reasoning }
    }
}

impl std::fmt::Debug for ReasoningJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningJudge").finish_non_exhaustive()
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

#[async_trait]
impl ValidationJudge for ReasoningJudge {
    async fn judge(&self, state: &CodeGenerationState) -> FlowResult<ValidationResult> {
        let prompt = format!(
            "Do these tests cover this code? Answer with JSON \
             {{passed, score, issues, recommendations}}.\n\nCode:\n{}\n\nTests:\n{}",
            state.generated_code().unwrap_or_default(),
            state.generated_tests().unwrap_or_default(),
        );
        let answer = self.reasoning.invoke(&prompt).await?;

        let verdict = match parse_json_answer(&answer) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Ok(ValidationResult::failed(
                    UNPARSEABLE_VERDICT_SCORE,
                    vec![format!("Validation verdict is not an object: {other}")],
                ))
            }
            Err(e) => {
                warn!(error = %e, "Unreadable validation verdict");
                return Ok(ValidationResult::failed(
                    UNPARSEABLE_VERDICT_SCORE,
                    vec![format!("Could not parse validation verdict: {e}")],
                ));
            }
        };

        let passed = verdict
            .get("passed")
            .or_else(|| verdict.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let score = verdict
            .get("score")
            .and_then(Value::as_u64)
            .map_or(0, |s| u8::try_from(s.min(100)).unwrap_or(100));
        let issues = strings(verdict.get("issues"));
        let recommendations = strings(verdict.get("recommendations"));

        let result = if passed {
            ValidationResult::passed(score)
        } else {
            ValidationResult::failed(score, issues)
        };
        Ok(result.with_recommendations(recommendations))
    }
}
