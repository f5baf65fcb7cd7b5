//! Thin business stages built on the collaborator ports.
//!
//! These stages carry no resilience logic of their own; breakers, recovery
//! and parallelism are applied by the workflow layer around them.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ports::{
    parse_json_answer, DependencyRegistry, ExecutionHarness, FileTools, ReasoningService,
    TicketSource,
};
use super::{Stage, StageCategory};
use crate::errors::{FlowError, FlowResult, ValidationError};
use crate::state::{keys, CodeGenerationState, RelevantFile, TestOutcome, TicketDetails};
use crate::tools::{Tool, ToolSet};

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "should", "must", "when", "will",
    "are", "can", "has", "have", "not", "all", "any", "new", "add", "use", "using", "into",
    "each", "been", "then", "than", "they", "their", "there", "which", "also", "only",
];

fn missing(key: &str) -> FlowError {
    FlowError::KeyAccess(format!("state has no '{key}'"))
}

fn require_ticket(state: &CodeGenerationState) -> FlowResult<&TicketDetails> {
    state.ticket().ok_or_else(|| missing(keys::REFINED_TICKET))
}

fn require_artifacts(state: &CodeGenerationState) -> FlowResult<(&str, &str)> {
    let code = state
        .generated_code()
        .ok_or_else(|| missing(keys::GENERATED_CODE))?;
    let tests = state
        .generated_tests()
        .ok_or_else(|| missing(keys::GENERATED_TESTS))?;
    Ok((code, tests))
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Loads the ticket body for the state's issue URL.
pub struct FetchIssueStage {
    source: Arc<dyn TicketSource>,
}

impl FetchIssueStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(source: Arc<dyn TicketSource>) -> Self {
        Self { source }
    }
}

impl std::fmt::Debug for FetchIssueStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchIssueStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for FetchIssueStage {
    fn name(&self) -> &str {
        "fetch_issue"
    }

    fn category(&self) -> Option<StageCategory> {
        Some(StageCategory::FetchIssue)
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let body = self.source.fetch(state.issue_url()).await?;
        if body.trim().is_empty() {
            return Err(ValidationError::new("Empty ticket content")
                .with_field(keys::TICKET_CONTENT)
                .into());
        }
        info!(url = %state.issue_url(), bytes = body.len(), "Fetched ticket");
        Ok(state.with_ticket_content(body))
    }
}

/// Turns raw ticket text into structured [`TicketDetails`].
pub struct TicketClarityStage {
    reasoning: Arc<dyn ReasoningService>,
}

impl TicketClarityStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(reasoning: Arc<dyn ReasoningService>) -> Self {
        Self { reasoning }
    }
}

impl std::fmt::Debug for TicketClarityStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketClarityStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for TicketClarityStage {
    fn name(&self) -> &str {
        "ticket_clarity"
    }

    fn category(&self) -> Option<StageCategory> {
        Some(StageCategory::TicketClarity)
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let content = state.ticket_content();
        if content.trim().is_empty() {
            return Err(missing(keys::TICKET_CONTENT));
        }

        let prompt = format!(
            "Rewrite this ticket as JSON with the fields title, description, \
             requirements and acceptance_criteria.\n\n{content}"
        );
        let answer = self.reasoning.invoke(&prompt).await?;
        let details = match parse_json_answer(&answer)
            .and_then(|v| serde_json::from_value::<TicketDetails>(v).map_err(FlowError::from))
        {
            Ok(details) => details,
            Err(err) => {
                warn!(error = %err, "Unstructured clarity answer, using raw ticket text");
                TicketDetails::from_raw_text(content)
            }
        };
        Ok(state.with_ticket_details(details))
    }
}

/// Adds implementation steps, packages and manual notes to the ticket.
pub struct ImplementationPlannerStage {
    reasoning: Arc<dyn ReasoningService>,
}

impl ImplementationPlannerStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(reasoning: Arc<dyn ReasoningService>) -> Self {
        Self { reasoning }
    }
}

impl std::fmt::Debug for ImplementationPlannerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplementationPlannerStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for ImplementationPlannerStage {
    fn name(&self) -> &str {
        "implementation_planner"
    }

    fn category(&self) -> Option<StageCategory> {
        Some(StageCategory::ImplementationPlanner)
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let ticket = require_ticket(&state)?;
        let prompt = format!(
            "Return JSON with implementation_steps, npm_packages and \
             manual_implementation_notes for:\nTitle: {}\nDescription: {}\n\
             Requirements:\n{}\nAcceptance Criteria:\n{}",
            ticket.title,
            ticket.description,
            bullet_list(&ticket.requirements),
            bullet_list(&ticket.acceptance_criteria),
        );
        let plan = parse_json_answer(&self.reasoning.invoke(&prompt).await?)?;

        let mut planned = ticket.clone();
        planned.implementation_steps = string_list(plan.get("implementation_steps"));
        planned.packages = string_list(plan.get("npm_packages").or_else(|| plan.get("packages")));
        if let Some(notes) = plan.get("manual_implementation_notes").and_then(Value::as_str) {
            planned.manual_implementation_notes = notes.to_string();
        }
        debug!(steps = planned.implementation_steps.len(), "Implementation planned");
        Ok(state.with_ticket_details(planned))
    }
}

/// Name of the tool the dependency analyzer binds to.
pub const DEPENDENCY_SEARCH_TOOL: &str = "dependency_search";

#[derive(Debug)]
struct ToolSearch {
    tool: Arc<dyn Tool>,
}

#[async_trait]
impl DependencyRegistry for ToolSearch {
    async fn search(&self, query: &str) -> FlowResult<Vec<String>> {
        let output = self.tool.invoke(json!({ "query": query })).await?;
        match output {
            Value::Array(_) => Ok(string_list(Some(&output))),
            other => Err(FlowError::TypeMismatch(format!(
                "{} returned {other}, expected a list of package names",
                self.tool.name()
            ))),
        }
    }
}

/// Resolves the packages the planned ticket asks for.
///
/// Uses the injected registry, or the `dependency_search` tool once bound.
/// Without either it records an empty dependency list.
#[derive(Clone, Default)]
pub struct DependencyAnalyzerStage {
    registry: Option<Arc<dyn DependencyRegistry>>,
}

impl DependencyAnalyzerStage {
    /// Creates an analyzer that waits for a tool binding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an analyzer backed by a registry.
    #[must_use]
    pub fn with_registry(registry: Arc<dyn DependencyRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }
}

impl std::fmt::Debug for DependencyAnalyzerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyAnalyzerStage")
            .field("has_registry", &self.registry.is_some())
            .finish()
    }
}

#[async_trait]
impl Stage for DependencyAnalyzerStage {
    fn name(&self) -> &str {
        "dependency_analyzer"
    }

    fn category(&self) -> Option<StageCategory> {
        Some(StageCategory::DependencyAnalyzer)
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let Some(ref registry) = self.registry else {
            warn!("No dependency registry bound, skipping dependency analysis");
            return Ok(state.with_dependencies(Vec::new()));
        };

        let requested: Vec<String> = state
            .ticket()
            .map(|t| t.packages.clone())
            .unwrap_or_default();

        let mut found = BTreeSet::new();
        for package in &requested {
            // Planner entries look like "uuid (id generation)".
            let Some(query) = package.split_whitespace().next() else {
                continue;
            };
            found.extend(registry.search(query).await?);
        }
        Ok(state.with_dependencies(found.into_iter().collect()))
    }

    fn bind_tools(&self, tools: &ToolSet) -> Option<Arc<dyn Stage>> {
        let tool = tools.get(DEPENDENCY_SEARCH_TOOL)?;
        Some(Arc::new(Self::with_registry(Arc::new(ToolSearch { tool }))))
    }
}

/// Loads the project files that mention identifiers from the ticket.
pub struct CodeExtractorStage {
    files: Arc<dyn FileTools>,
    source_dir: String,
}

impl CodeExtractorStage {
    /// Creates the stage scanning `src`.
    #[must_use]
    pub fn new(files: Arc<dyn FileTools>) -> Self {
        Self {
            files,
            source_dir: "src".to_string(),
        }
    }

    /// Scans `dir` instead of `src`.
    #[must_use]
    pub fn with_source_dir(mut self, dir: impl Into<String>) -> Self {
        self.source_dir = dir.into();
        self
    }

    fn identifiers(ticket: &TicketDetails) -> FlowResult<Vec<String>> {
        let pattern = Regex::new(r"\b[a-zA-Z_][a-zA-Z0-9_]*\b")
            .map_err(|e| FlowError::Internal(e.to_string()))?;
        let text = [
            ticket.title.as_str(),
            ticket.description.as_str(),
            &ticket.requirements.join(" "),
            &ticket.acceptance_criteria.join(" "),
        ]
        .join(" ");

        let mut seen = BTreeSet::new();
        Ok(pattern
            .find_iter(&text)
            .map(|m| m.as_str().to_lowercase())
            .filter(|id| id.len() > 2 && !STOP_WORDS.contains(&id.as_str()))
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    fn is_test_file(path: &str) -> bool {
        path.split('/').any(|part| part == "__tests__") || path.contains(".test.")
    }
}

impl std::fmt::Debug for CodeExtractorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeExtractorStage")
            .field("source_dir", &self.source_dir)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for CodeExtractorStage {
    fn name(&self) -> &str {
        "code_extractor"
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let identifiers = Self::identifiers(require_ticket(&state)?)?;
        if identifiers.is_empty() {
            return Ok(state.with_relevant_files(Vec::new(), Vec::new()));
        }

        let mut code_files = Vec::new();
        let mut test_files = Vec::new();
        for path in self.files.list(&self.source_dir).await? {
            let content = self.files.read(&path).await?;
            let haystack = format!("{}\n{}", path.to_lowercase(), content.to_lowercase());
            if !identifiers.iter().any(|id| haystack.contains(id.as_str())) {
                continue;
            }
            let file = RelevantFile::new(path.as_str(), content);
            if Self::is_test_file(&path) {
                test_files.push(file);
            } else {
                code_files.push(file);
            }
        }
        debug!(
            code = code_files.len(),
            tests = test_files.len(),
            "Relevant files extracted"
        );
        Ok(state.with_relevant_files(code_files, test_files))
    }
}

/// Writes generated code and tests into the project.
///
/// Generated artifacts are appended to the relevant files when there are
/// any. Otherwise new files named after the ticket title are created.
pub struct CodeIntegratorStage {
    files: Arc<dyn FileTools>,
}

impl CodeIntegratorStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(files: Arc<dyn FileTools>) -> Self {
        Self { files }
    }

    fn file_stem(title: &str) -> String {
        let sanitized: String = title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        match sanitized.split('_').next() {
            Some(stem) if !stem.is_empty() => stem.to_string(),
            _ => "newFeature".to_string(),
        }
    }
}

impl std::fmt::Debug for CodeIntegratorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeIntegratorStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for CodeIntegratorStage {
    fn name(&self) -> &str {
        "code_integrator"
    }

    fn category(&self) -> Option<StageCategory> {
        Some(StageCategory::CodeIntegrator)
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let (code, tests) = require_artifacts(&state)?;

        if !state.relevant_code_files().is_empty() || !state.relevant_test_files().is_empty() {
            for file in state.relevant_code_files() {
                self.files
                    .write(&file.path, &format!("{}\n\n{code}\n", file.content.trim_end()))
                    .await?;
            }
            for file in state.relevant_test_files() {
                self.files
                    .write(&file.path, &format!("{}\n\n{tests}\n", file.content.trim_end()))
                    .await?;
            }
            return Ok(state);
        }

        let title = state.ticket().map_or("", |t| t.title.as_str());
        let stem = Self::file_stem(title);
        let code_path = format!("src/{stem}.ts");
        let test_path = format!("src/__tests__/{stem}.test.ts");
        self.files.write(&code_path, code).await?;
        self.files.write(&test_path, tests).await?;
        info!(code = %code_path, tests = %test_path, "Integrated generated files");

        let code_files = vec![RelevantFile::new(code_path, code)];
        let test_files = vec![RelevantFile::new(test_path, tests)];
        Ok(state.with_relevant_files(code_files, test_files))
    }
}

/// Runs the generated tests through the execution harness.
pub struct TestRunnerStage {
    harness: Arc<dyn ExecutionHarness>,
}

impl TestRunnerStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(harness: Arc<dyn ExecutionHarness>) -> Self {
        Self { harness }
    }
}

impl std::fmt::Debug for TestRunnerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRunnerStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for TestRunnerStage {
    fn name(&self) -> &str {
        "test_runner"
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let (code, tests) = require_artifacts(&state)?;
        let context = json!({
            "framework": state.test_spec().framework,
            "test_type": state.test_spec().test_type,
            "language": state.code_spec().language,
        });
        let metrics = self.harness.execute(code, tests, &context).await?;
        info!(
            passed = metrics.tests_passed,
            failed = metrics.tests_failed,
            success = metrics.success,
            "Test run finished"
        );
        Ok(state.with_test_outcome(TestOutcome {
            passed: metrics.tests_passed,
            failed: metrics.tests_failed,
            errors: metrics.errors,
            log_path: metrics.log_path,
        }))
    }
}

/// Asks the reasoning service whether code and tests match the ticket.
pub struct CodeReviewerStage {
    reasoning: Arc<dyn ReasoningService>,
}

impl CodeReviewerStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(reasoning: Arc<dyn ReasoningService>) -> Self {
        Self { reasoning }
    }
}

impl std::fmt::Debug for CodeReviewerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeReviewerStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for CodeReviewerStage {
    fn name(&self) -> &str {
        "code_reviewer"
    }

    fn category(&self) -> Option<StageCategory> {
        Some(StageCategory::CodeReviewer)
    }

    async fn process(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        let (code, tests) = require_artifacts(&state)?;
        let title = state.ticket().map_or("", |t| t.title.as_str());
        let prompt = format!(
            "Review the code and tests for '{title}'. Return JSON with is_aligned, \
             feedback, tuned_prompt and needs_fix.\n\nCode:\n{code}\n\nTests:\n{tests}"
        );
        let answer = self.reasoning.invoke(&prompt).await?;
        let review = parse_json_answer(&answer).unwrap_or_else(|err| {
            warn!(error = %err, "Unparseable review answer");
            json!({
                "is_aligned": false,
                "feedback": "Invalid JSON response from reasoning service",
                "tuned_prompt": "",
                "needs_fix": true,
            })
        });
        Ok(state.with_feedback(review))
    }
}

#[cfg(test)]
mod tests {
    use super::super::ports::{
        ExecutionMetrics, MockDependencyRegistry, MockExecutionHarness, MockFileTools,
        MockReasoningService, MockTicketSource,
    };
    use super::*;
    use crate::errors::ErrorKind;
    use crate::tools::{FnTool, ToolRegistry};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    const URL: &str = "https://github.com/acme/widgets/issues/7";

    fn planned_state() -> CodeGenerationState {
        CodeGenerationState::new(URL).with_ticket_details(
            TicketDetails::new("Export widgets", "Allow CSV export of widgets")
                .with_requirements(vec!["exportCsv returns a string".into()])
                .with_packages(vec!["papaparse (CSV parsing)".into(), "lodash".into()]),
        )
    }

    fn generated_state() -> CodeGenerationState {
        planned_state()
            .with_code("export function exportCsv() {}", Some("exportCsv".into()), None)
            .with_tests("describe('x', () => { it('y', () => exportCsv()); });")
    }

    #[tokio::test]
    async fn test_fetch_issue_sets_content() {
        let mut source = MockTicketSource::new();
        source
            .expect_fetch()
            .with(eq(URL))
            .returning(|_| Ok("## Export widgets\nCSV please".to_string()));

        let stage = FetchIssueStage::new(Arc::new(source));
        let out = stage.process(CodeGenerationState::new(URL)).await.unwrap();
        assert_eq!(out.ticket_content(), "## Export widgets\nCSV please");
    }

    #[tokio::test]
    async fn test_fetch_issue_rejects_empty_body() {
        let mut source = MockTicketSource::new();
        source.expect_fetch().returning(|_| Ok("  \n".to_string()));

        let err = FetchIssueStage::new(Arc::new(source))
            .process(CodeGenerationState::new(URL))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_ticket_clarity_parses_answer() {
        let mut reasoning = MockReasoningService::new();
        reasoning.expect_invoke().returning(|_| {
            Ok(r#"Here you go: {"title": "Export", "description": "CSV", "requirements": ["r1"]}"#
                .to_string())
        });

        let state = CodeGenerationState::new(URL).with_ticket_content("Export widgets as CSV");
        let out = TicketClarityStage::new(Arc::new(reasoning))
            .process(state)
            .await
            .unwrap();
        let ticket = out.ticket().unwrap();
        assert_eq!(ticket.title, "Export");
        assert_eq!(ticket.requirements, vec!["r1"]);
    }

    #[tokio::test]
    async fn test_ticket_clarity_falls_back_to_raw_text() {
        let mut reasoning = MockReasoningService::new();
        reasoning
            .expect_invoke()
            .returning(|_| Ok("I could not structure this.".to_string()));

        let state = CodeGenerationState::new(URL).with_ticket_content("# Export widgets\nDetails");
        let out = TicketClarityStage::new(Arc::new(reasoning))
            .process(state)
            .await
            .unwrap();
        assert_eq!(out.ticket().unwrap().title, "Export widgets");
    }

    #[tokio::test]
    async fn test_ticket_clarity_requires_content() {
        let reasoning = MockReasoningService::new();
        let err = TicketClarityStage::new(Arc::new(reasoning))
            .process(CodeGenerationState::new(URL))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyAccess);
    }

    #[tokio::test]
    async fn test_planner_merges_plan_into_ticket() {
        let mut reasoning = MockReasoningService::new();
        reasoning.expect_invoke().returning(|_| {
            Ok(json!({
                "implementation_steps": ["write exporter", "wire command"],
                "npm_packages": ["papaparse (CSV)"],
                "manual_implementation_notes": "none"
            })
            .to_string())
        });

        let out = ImplementationPlannerStage::new(Arc::new(reasoning))
            .process(planned_state())
            .await
            .unwrap();
        let ticket = out.ticket().unwrap();
        assert_eq!(ticket.title, "Export widgets");
        assert_eq!(ticket.implementation_steps.len(), 2);
        assert_eq!(ticket.packages, vec!["papaparse (CSV)"]);
        assert_eq!(ticket.manual_implementation_notes, "none");
    }

    #[tokio::test]
    async fn test_planner_surfaces_parse_errors() {
        let mut reasoning = MockReasoningService::new();
        reasoning.expect_invoke().returning(|_| Ok("no plan".to_string()));

        let err = ImplementationPlannerStage::new(Arc::new(reasoning))
            .process(planned_state())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_dependency_analyzer_searches_each_package() {
        let mut registry = MockDependencyRegistry::new();
        registry
            .expect_search()
            .with(eq("papaparse"))
            .returning(|_| Ok(vec!["papaparse".to_string()]));
        registry
            .expect_search()
            .with(eq("lodash"))
            .returning(|_| Ok(vec!["lodash".to_string(), "lodash-es".to_string()]));

        let out = DependencyAnalyzerStage::with_registry(Arc::new(registry))
            .process(planned_state())
            .await
            .unwrap();
        assert_eq!(out.available_dependencies(), ["lodash", "lodash-es", "papaparse"]);
    }

    #[tokio::test]
    async fn test_dependency_analyzer_binds_search_tool() {
        let tools = ToolRegistry::new();
        tools.register(Arc::new(FnTool::new(
            DEPENDENCY_SEARCH_TOOL,
            "package lookup",
            |input: Value| Ok(json!([input["query"].as_str().unwrap_or_default()])),
        )));
        let set = tools.select(&[DEPENDENCY_SEARCH_TOOL.to_string()]).unwrap();

        let unbound = DependencyAnalyzerStage::new();
        let out = unbound.process(planned_state()).await.unwrap();
        assert!(out.available_dependencies().is_empty());

        let bound = unbound.bind_tools(&set).unwrap();
        let out = bound.process(planned_state()).await.unwrap();
        assert_eq!(out.available_dependencies(), ["lodash", "papaparse"]);

        assert!(unbound.bind_tools(&ToolSet::default()).is_none());
    }

    #[tokio::test]
    async fn test_code_extractor_splits_code_and_tests() {
        let mut files = MockFileTools::new();
        files.expect_list().with(eq("src")).returning(|_| {
            Ok(vec![
                "src/widgets.ts".to_string(),
                "src/__tests__/widgets.test.ts".to_string(),
                "src/unrelated.ts".to_string(),
            ])
        });
        files.expect_read().returning(|path| {
            Ok(match path {
                "src/unrelated.ts" => "const x = 1;".to_string(),
                _ => "import { exportCsv } from './widgets';".to_string(),
            })
        });

        let out = CodeExtractorStage::new(Arc::new(files))
            .process(planned_state())
            .await
            .unwrap();
        assert_eq!(out.relevant_code_files().len(), 1);
        assert_eq!(out.relevant_code_files()[0].path, "src/widgets.ts");
        assert_eq!(out.relevant_test_files()[0].path, "src/__tests__/widgets.test.ts");
    }

    #[test]
    fn test_identifier_extraction_drops_stop_words() {
        let ticket = TicketDetails::new("Add the exporter", "It should use CSV");
        let ids = CodeExtractorStage::identifiers(&ticket).unwrap();
        assert_eq!(ids, vec!["exporter", "csv"]);
    }

    #[tokio::test]
    async fn test_code_integrator_creates_files_from_title() {
        let mut files = MockFileTools::new();
        files
            .expect_write()
            .withf(|path, _| path == "src/export.ts" || path == "src/__tests__/export.test.ts")
            .times(2)
            .returning(|_, _| Ok(()));

        let out = CodeIntegratorStage::new(Arc::new(files))
            .process(generated_state())
            .await
            .unwrap();
        assert_eq!(out.relevant_code_files()[0].path, "src/export.ts");
        assert_eq!(out.relevant_test_files()[0].path, "src/__tests__/export.test.ts");
    }

    #[tokio::test]
    async fn test_code_integrator_appends_to_relevant_files() {
        let mut files = MockFileTools::new();
        files
            .expect_write()
            .withf(|path, content| {
                path == "src/widgets.ts" && content.starts_with("export const a = 1;\n\nexport function")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let state = generated_state()
            .with_relevant_files(vec![RelevantFile::new("src/widgets.ts", "export const a = 1;\n")], Vec::new());
        CodeIntegratorStage::new(Arc::new(files)).process(state).await.unwrap();
    }

    #[tokio::test]
    async fn test_code_integrator_requires_artifacts() {
        let err = CodeIntegratorStage::new(Arc::new(MockFileTools::new()))
            .process(planned_state())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyAccess);
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(CodeIntegratorStage::file_stem("Export widgets"), "export");
        assert_eq!(CodeIntegratorStage::file_stem(""), "newFeature");
        assert_eq!(CodeIntegratorStage::file_stem("!!"), "newFeature");
    }

    #[tokio::test]
    async fn test_runner_records_outcome() {
        let mut harness = MockExecutionHarness::new();
        harness
            .expect_execute()
            .withf(|_, _, ctx| ctx["framework"] == "jest")
            .returning(|_, _, _| {
                Ok(ExecutionMetrics {
                    success: false,
                    tests_passed: 4,
                    tests_failed: 1,
                    errors: vec!["expected 2".into()],
                    log_path: Some("/tmp/jest.log".into()),
                })
            });

        let out = TestRunnerStage::new(Arc::new(harness))
            .process(generated_state())
            .await
            .unwrap();
        let outcome = out.test_outcome();
        assert_eq!((outcome.passed, outcome.failed), (4, 1));
        assert_eq!(outcome.log_path.as_deref(), Some("/tmp/jest.log"));
    }

    #[tokio::test]
    async fn test_reviewer_defaults_on_bad_answer() {
        let mut reasoning = MockReasoningService::new();
        reasoning.expect_invoke().returning(|_| Ok("looks fine".to_string()));

        let out = CodeReviewerStage::new(Arc::new(reasoning))
            .process(generated_state())
            .await
            .unwrap();
        assert_eq!(out.feedback().unwrap()["needs_fix"], true);
    }

    #[tokio::test]
    async fn test_reviewer_propagates_service_errors() {
        let mut reasoning = MockReasoningService::new();
        reasoning
            .expect_invoke()
            .returning(|_| Err(FlowError::Timeout("review".into())));

        let err = CodeReviewerStage::new(Arc::new(reasoning))
            .process(generated_state())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
