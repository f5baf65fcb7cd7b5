//! Ports - the external collaborators business stages depend on.
//!
//! Each port is a narrow trait so a stage only receives what it needs. Real
//! adapters live outside this crate; tests substitute mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::errors::{FlowError, FlowResult};
use crate::health::HealthProbe;

/// Loads raw ticket text for an issue URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Fetches the ticket body.
    async fn fetch(&self, url: &str) -> FlowResult<String>;
}

/// A text-in, text-out reasoning model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Sends a prompt and returns the model's answer.
    async fn invoke(&self, prompt: &str) -> FlowResult<String>;

    /// Returns whether the service is reachable.
    async fn is_available(&self) -> bool;
}

/// Counts and logs reported by an execution harness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionMetrics {
    /// Whether the whole run succeeded.
    pub success: bool,
    /// Passing tests.
    pub tests_passed: u32,
    /// Failing tests.
    pub tests_failed: u32,
    /// Failure messages.
    pub errors: Vec<String>,
    /// Location of the harness log.
    pub log_path: Option<String>,
}

/// Compiles and runs generated code against its tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionHarness: Send + Sync {
    /// Executes `tests` against `code`.
    async fn execute(&self, code: &str, tests: &str, config: &Value) -> FlowResult<ExecutionMetrics>;
}

/// Project file access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileTools: Send + Sync {
    /// Reads a file relative to the project root.
    async fn read(&self, path: &str) -> FlowResult<String>;

    /// Writes a file relative to the project root.
    async fn write(&self, path: &str, content: &str) -> FlowResult<()>;

    /// Lists files under a directory.
    async fn list(&self, dir: &str) -> FlowResult<Vec<String>>;
}

/// Looks up packages available to generated code.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DependencyRegistry: Send + Sync {
    /// Returns package names matching `query`.
    async fn search(&self, query: &str) -> FlowResult<Vec<String>>;
}

/// Health probe that asks a reasoning service whether it is available.
pub struct ServiceProbe {
    service: Arc<dyn ReasoningService>,
}

impl ServiceProbe {
    /// Wraps a reasoning service.
    #[must_use]
    pub fn new(service: Arc<dyn ReasoningService>) -> Self {
        Self { service }
    }
}

impl std::fmt::Debug for ServiceProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProbe").finish_non_exhaustive()
    }
}

#[async_trait]
impl HealthProbe for ServiceProbe {
    async fn check(&self) -> FlowResult<bool> {
        Ok(self.service.is_available().await)
    }
}

/// Extracts the JSON object embedded in a model answer.
///
/// Models tend to wrap JSON in prose or code fences, so everything outside
/// the first `{` and the last `}` is ignored.
pub fn parse_json_answer(text: &str) -> FlowResult<Value> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&text[start..=end])
            .map_err(|e| FlowError::Parse(format!("invalid JSON in answer: {e}"))),
        _ => Err(FlowError::Parse("no JSON object in answer".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_parse_json_answer() {
        let answer = "Sure!\n```json\n{\"title\": \"Export\", \"steps\": [\"a\"]}\n```";
        assert_eq!(
            parse_json_answer(answer).unwrap(),
            json!({"title": "Export", "steps": ["a"]})
        );
        assert_eq!(parse_json_answer("no json").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(parse_json_answer("{ broken").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(parse_json_answer("} {").unwrap_err().kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_service_probe_reports_availability() {
        let mut service = MockReasoningService::new();
        service.expect_is_available().times(1).returning(|| false);
        let probe = ServiceProbe::new(Arc::new(service));
        assert!(!probe.check().await.unwrap());
    }
}
