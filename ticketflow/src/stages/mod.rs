//! Stage trait and implementations.
//!
//! Stages are the fundamental units of work in a ticketflow pipeline. Each
//! one transforms a [`CodeGenerationState`] into a new state; a stage may
//! add or replace fields but never drops unrelated ones.

mod builtin;
mod guard;
mod ports;

pub use builtin::{
    CodeExtractorStage, CodeIntegratorStage, CodeReviewerStage, DependencyAnalyzerStage,
    FetchIssueStage, ImplementationPlannerStage, TestRunnerStage, TicketClarityStage,
    DEPENDENCY_SEARCH_TOOL,
};
pub use guard::GuardedStage;
pub use ports::{
    parse_json_answer, DependencyRegistry, ExecutionHarness, ExecutionMetrics, FileTools,
    ReasoningService, ServiceProbe, TicketSource,
};
#[cfg(test)]
pub(crate) use ports::{
    MockDependencyRegistry, MockExecutionHarness, MockFileTools, MockReasoningService,
    MockTicketSource,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::errors::{FlowError, FlowResult};
use crate::state::CodeGenerationState;
use crate::tools::ToolSet;

/// The closed set of stage categories known to the recovery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCategory {
    /// Loads the ticket text.
    FetchIssue,
    /// Turns ticket text into structured details.
    TicketClarity,
    /// Plans implementation steps.
    ImplementationPlanner,
    /// Resolves available packages.
    DependencyAnalyzer,
    /// Generates the implementation.
    CodeGenerator,
    /// Generates the tests.
    TestGenerator,
    /// Writes generated artifacts into the project.
    CodeIntegrator,
    /// Reviews the result.
    CodeReviewer,
}

impl StageCategory {
    /// All categories.
    pub const ALL: [Self; 8] = [
        Self::FetchIssue,
        Self::TicketClarity,
        Self::ImplementationPlanner,
        Self::DependencyAnalyzer,
        Self::CodeGenerator,
        Self::TestGenerator,
        Self::CodeIntegrator,
        Self::CodeReviewer,
    ];

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FetchIssue => "fetch_issue",
            Self::TicketClarity => "ticket_clarity",
            Self::ImplementationPlanner => "implementation_planner",
            Self::DependencyAnalyzer => "dependency_analyzer",
            Self::CodeGenerator => "code_generator",
            Self::TestGenerator => "test_generator",
            Self::CodeIntegrator => "code_integrator",
            Self::CodeReviewer => "code_reviewer",
        }
    }

    /// Parses a category name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == normalized)
    }
}

impl fmt::Display for StageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for pipeline stages.
///
/// `process` is the only extension point; its default fails with
/// [`FlowError::NotImplemented`].
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Returns the recovery category of the stage, if it has one.
    fn category(&self) -> Option<StageCategory> {
        None
    }

    /// Transforms the state.
    async fn process(&self, _state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        Err(FlowError::NotImplemented {
            stage: self.name().to_string(),
        })
    }

    /// Returns a copy of this stage bound to `tools`, or `None` when the
    /// stage does not use tools.
    fn bind_tools(&self, _tools: &ToolSet) -> Option<Arc<dyn Stage>> {
        None
    }
}

/// A stage backed by a synchronous closure.
pub struct FnStage<F>
where
    F: Fn(CodeGenerationState) -> FlowResult<CodeGenerationState> + Send + Sync,
{
    name: String,
    category: Option<StageCategory>,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(CodeGenerationState) -> FlowResult<CodeGenerationState> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            category: None,
            func,
        }
    }

    /// Sets the recovery category.
    #[must_use]
    pub fn with_category(mut self, category: StageCategory) -> Self {
        self.category = Some(category);
        self
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(CodeGenerationState) -> FlowResult<CodeGenerationState> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(CodeGenerationState) -> FlowResult<CodeGenerationState> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Option<StageCategory> {
        self.category
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        (self.func)(state)
    }
}

/// A stage that returns its input unchanged.
#[derive(Debug, Clone)]
pub struct PassthroughStage {
    name: String,
}

impl PassthroughStage {
    /// Creates a passthrough stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for PassthroughStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[derive(Debug)]
    struct Unspecialized;

    impl Stage for Unspecialized {
        fn name(&self) -> &str {
            "unspecialized"
        }
    }

    fn state() -> CodeGenerationState {
        CodeGenerationState::new("https://github.com/acme/widgets/issues/1")
    }

    #[tokio::test]
    async fn test_default_process_is_not_implemented() {
        let err = Unspecialized.process(state()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        assert!(err.to_string().contains("unspecialized"));
    }

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("tests", |s: CodeGenerationState| Ok(s.with_tests("describe()")))
            .with_category(StageCategory::TestGenerator);
        assert_eq!(stage.category(), Some(StageCategory::TestGenerator));

        let out = stage.process(state()).await.unwrap();
        assert_eq!(out.generated_tests(), Some("describe()"));
    }

    #[tokio::test]
    async fn test_passthrough_stage() {
        let input = state().with_ticket_content("ticket");
        let out = PassthroughStage::new("noop").process(input.clone()).await.unwrap();
        assert_eq!(out, input);
        assert!(PassthroughStage::new("noop").bind_tools(&ToolSet::default()).is_none());
    }

    #[test]
    fn test_category_names() {
        for category in StageCategory::ALL {
            assert_eq!(StageCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(StageCategory::parse("CODE_GENERATOR"), Some(StageCategory::CodeGenerator));
        assert_eq!(StageCategory::parse("unknown"), None);
    }
}
