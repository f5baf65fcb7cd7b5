//! The code generation state container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

use super::keys;
use super::model::{CodeSpec, RelevantFile, TestOutcome, TestSpec, TicketDetails, ValidationResult};

/// One entry of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the trail, starting at zero.
    pub sequence: usize,
    /// The transformation that produced this entry (e.g. `with_code`).
    pub operation: String,
    /// Mapping keys the transformation changed.
    pub fields: Vec<String>,
    /// SHA-256 of the artifact written, when the operation wrote one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// When the transformation happened.
    pub timestamp: DateTime<Utc>,
}

/// Immutable record threaded through every stage of a run.
///
/// Fields are private and there are no setters: every change goes through a
/// `with_*` method that returns a new instance and leaves the receiver
/// untouched. Each transformation appends an [`AuditEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeGenerationState {
    #[serde(rename = "url")]
    issue_url: String,
    ticket_content: String,
    #[serde(rename = "refined_ticket", skip_serializing_if = "Option::is_none")]
    ticket: Option<TicketDetails>,
    code_spec: CodeSpec,
    test_spec: TestSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    generated_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generated_tests: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_id: Option<String>,
    #[serde(rename = "validation_results", skip_serializing_if = "Option::is_none")]
    validation: Option<ValidationResult>,
    validation_history: Vec<ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    relevant_code_files: Vec<RelevantFile>,
    relevant_test_files: Vec<RelevantFile>,
    available_dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<Value>,
    existing_tests_passed: u32,
    existing_tests_failed: u32,
    test_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_log_path: Option<String>,
    recovery_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery_explanation: Option<String>,
    #[serde(rename = "audit_trail")]
    history: Vec<AuditEntry>,
    #[serde(flatten)]
    annotations: BTreeMap<String, Value>,
}

impl Default for CodeGenerationState {
    fn default() -> Self {
        Self {
            issue_url: String::new(),
            ticket_content: String::new(),
            ticket: None,
            code_spec: CodeSpec::default(),
            test_spec: TestSpec::default(),
            generated_code: None,
            generated_tests: None,
            method_name: None,
            command_id: None,
            validation: None,
            validation_history: Vec::new(),
            result: None,
            relevant_code_files: Vec::new(),
            relevant_test_files: Vec::new(),
            available_dependencies: Vec::new(),
            feedback: None,
            existing_tests_passed: 0,
            existing_tests_failed: 0,
            test_errors: Vec::new(),
            test_log_path: None,
            recovery_confidence: 100.0,
            recovery_explanation: None,
            history: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

fn digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

impl CodeGenerationState {
    /// Creates a state for a work item.
    #[must_use]
    pub fn new(issue_url: impl Into<String>) -> Self {
        Self {
            issue_url: issue_url.into(),
            ..Self::default()
        }
    }

    fn derive(&self, operation: &str, fields: &[&str], artifact: Option<&str>) -> Self {
        let mut next = self.clone();
        next.history.push(AuditEntry {
            sequence: self.history.len(),
            operation: operation.to_string(),
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
            digest: artifact.map(digest),
            timestamp: Utc::now(),
        });
        next
    }

    /// Returns a copy with the raw ticket text set.
    #[must_use]
    pub fn with_ticket_content(&self, content: impl Into<String>) -> Self {
        let content = content.into();
        let mut next = self.derive("with_ticket_content", &["ticket_content"], Some(&content));
        next.ticket_content = content;
        next
    }

    /// Returns a copy with structured ticket details set.
    #[must_use]
    pub fn with_ticket_details(&self, details: TicketDetails) -> Self {
        let mut next = self.derive("with_ticket_details", &["refined_ticket"], None);
        next.ticket = Some(details);
        next
    }

    /// Returns a copy with generated code set.
    ///
    /// `method_name` and `command_id` keep their previous values when `None`.
    #[must_use]
    pub fn with_code(
        &self,
        code: impl Into<String>,
        method_name: Option<String>,
        command_id: Option<String>,
    ) -> Self {
        let code = code.into();
        let mut next = self.derive(
            "with_code",
            &["generated_code", "method_name", "command_id"],
            Some(&code),
        );
        next.generated_code = Some(code);
        if method_name.is_some() {
            next.method_name = method_name;
        }
        if command_id.is_some() {
            next.command_id = command_id;
        }
        next
    }

    /// Returns a copy with generated tests set.
    #[must_use]
    pub fn with_tests(&self, tests: impl Into<String>) -> Self {
        let tests = tests.into();
        let mut next = self.derive("with_tests", &["generated_tests"], Some(&tests));
        next.generated_tests = Some(tests);
        next
    }

    /// Returns a copy with the validation result set and appended to the
    /// validation history.
    #[must_use]
    pub fn with_validation(&self, result: ValidationResult) -> Self {
        let mut next = self.derive(
            "with_validation",
            &["validation_results", "validation_history"],
            None,
        );
        next.validation_history.push(result.clone());
        next.validation = Some(result);
        next
    }

    /// Returns a copy with feedback set.
    #[must_use]
    pub fn with_feedback(&self, feedback: Value) -> Self {
        let mut next = self.derive("with_feedback", &["feedback"], None);
        next.feedback = Some(feedback);
        next
    }

    /// Returns a copy with the structured result set.
    #[must_use]
    pub fn with_result(&self, result: Value) -> Self {
        let mut next = self.derive("with_result", &["result"], None);
        next.result = Some(result);
        next
    }

    /// Returns a copy with the relevant source and test files set.
    #[must_use]
    pub fn with_relevant_files(
        &self,
        code_files: Vec<RelevantFile>,
        test_files: Vec<RelevantFile>,
    ) -> Self {
        let mut next = self.derive(
            "with_relevant_files",
            &["relevant_code_files", "relevant_test_files"],
            None,
        );
        next.relevant_code_files = code_files;
        next.relevant_test_files = test_files;
        next
    }

    /// Returns a copy with the available dependencies set.
    #[must_use]
    pub fn with_dependencies(&self, dependencies: Vec<String>) -> Self {
        let mut next = self.derive("with_dependencies", &["available_dependencies"], None);
        next.available_dependencies = dependencies;
        next
    }

    /// Returns a copy with the code generation settings set.
    #[must_use]
    pub fn with_code_spec(&self, spec: CodeSpec) -> Self {
        let mut next = self.derive("with_code_spec", &["code_spec"], None);
        next.code_spec = spec;
        next
    }

    /// Returns a copy with the test execution outcome recorded.
    #[must_use]
    pub fn with_test_outcome(&self, outcome: TestOutcome) -> Self {
        let mut next = self.derive(
            "with_test_outcome",
            &[
                "existing_tests_passed",
                "existing_tests_failed",
                "test_errors",
                "test_log_path",
            ],
            None,
        );
        next.existing_tests_passed = outcome.passed;
        next.existing_tests_failed = outcome.failed;
        next.test_errors = outcome.errors;
        next.test_log_path = outcome.log_path;
        next
    }

    /// Returns a copy with a free-form annotation set.
    ///
    /// Keys naming a typed field (see [`keys::is_typed_field`]) are ignored
    /// and the receiver is returned unchanged; use the matching `with_*`
    /// method instead.
    #[must_use]
    pub fn with_annotation(&self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if keys::is_typed_field(&key) {
            warn!(key = %key, "Annotation key shadows a typed field; ignored");
            return self.clone();
        }
        let mut next = self.derive("with_annotation", &[key.as_str()], None);
        next.annotations.insert(key, value);
        next
    }

    /// Returns a copy with the named output fields reset to empty.
    ///
    /// Accepts mapping keys; unknown keys remove the annotation of that name.
    #[must_use]
    pub fn cleared(&self, fields: &[&str]) -> Self {
        let mut next = self.derive("cleared", fields, None);
        for field in fields {
            match *field {
                keys::TICKET_CONTENT => next.ticket_content.clear(),
                keys::REFINED_TICKET => next.ticket = None,
                keys::GENERATED_CODE => next.generated_code = None,
                keys::GENERATED_TESTS => next.generated_tests = None,
                keys::RESULT => next.result = None,
                keys::FEEDBACK => next.feedback = None,
                keys::RELEVANT_CODE_FILES => next.relevant_code_files.clear(),
                keys::RELEVANT_TEST_FILES => next.relevant_test_files.clear(),
                keys::AVAILABLE_DEPENDENCIES => next.available_dependencies.clear(),
                keys::TEST_ERRORS => next.test_errors.clear(),
                other => {
                    next.annotations.remove(other);
                }
            }
        }
        next
    }

    /// Returns a defensive copy of the audit trail.
    #[must_use]
    pub fn get_audit_trail(&self) -> Vec<AuditEntry> {
        self.history.clone()
    }

    /// The work item identifier.
    #[must_use]
    pub fn issue_url(&self) -> &str {
        &self.issue_url
    }

    /// Raw ticket text.
    #[must_use]
    pub fn ticket_content(&self) -> &str {
        &self.ticket_content
    }

    /// Structured ticket details, once produced.
    #[must_use]
    pub fn ticket(&self) -> Option<&TicketDetails> {
        self.ticket.as_ref()
    }

    /// Code generation settings.
    #[must_use]
    pub fn code_spec(&self) -> &CodeSpec {
        &self.code_spec
    }

    /// Test generation settings.
    #[must_use]
    pub fn test_spec(&self) -> &TestSpec {
        &self.test_spec
    }

    /// Generated implementation.
    #[must_use]
    pub fn generated_code(&self) -> Option<&str> {
        self.generated_code.as_deref()
    }

    /// Generated tests.
    #[must_use]
    pub fn generated_tests(&self) -> Option<&str> {
        self.generated_tests.as_deref()
    }

    /// Primary method name of the implementation.
    #[must_use]
    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    /// Command identifier the tests must reference.
    #[must_use]
    pub fn command_id(&self) -> Option<&str> {
        self.command_id.as_deref()
    }

    /// Latest validation result.
    #[must_use]
    pub fn validation(&self) -> Option<&ValidationResult> {
        self.validation.as_ref()
    }

    /// All validation results, oldest first.
    #[must_use]
    pub fn validation_history(&self) -> &[ValidationResult] {
        &self.validation_history
    }

    /// Structured result.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Relevant source files.
    #[must_use]
    pub fn relevant_code_files(&self) -> &[RelevantFile] {
        &self.relevant_code_files
    }

    /// Relevant test files.
    #[must_use]
    pub fn relevant_test_files(&self) -> &[RelevantFile] {
        &self.relevant_test_files
    }

    /// Packages available to the implementation.
    #[must_use]
    pub fn available_dependencies(&self) -> &[String] {
        &self.available_dependencies
    }

    /// Free-form feedback.
    #[must_use]
    pub fn feedback(&self) -> Option<&Value> {
        self.feedback.as_ref()
    }

    /// Test execution outcome.
    #[must_use]
    pub fn test_outcome(&self) -> TestOutcome {
        TestOutcome {
            passed: self.existing_tests_passed,
            failed: self.existing_tests_failed,
            errors: self.test_errors.clone(),
            log_path: self.test_log_path.clone(),
        }
    }

    /// Confidence left after recovery, from 0 to 100.
    #[must_use]
    pub fn recovery_confidence(&self) -> f64 {
        self.recovery_confidence
    }

    /// Explanation recorded by recovery, if any.
    #[must_use]
    pub fn recovery_explanation(&self) -> Option<&str> {
        self.recovery_explanation.as_deref()
    }

    /// A free-form annotation.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&Value> {
        self.annotations.get(key)
    }

    /// All free-form annotations.
    #[must_use]
    pub fn annotations(&self) -> &BTreeMap<String, Value> {
        &self.annotations
    }

    /// Returns true when the annotation is the boolean `true`.
    #[must_use]
    pub fn is_flagged(&self, key: &str) -> bool {
        matches!(self.annotations.get(key), Some(Value::Bool(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const URL: &str = "https://github.com/acme/widgets/issues/7";

    fn without_trail(state: &CodeGenerationState) -> serde_json::Map<String, Value> {
        let mut map = state.to_mapping().unwrap_or_default();
        map.remove("audit_trail");
        map
    }

    #[test]
    fn test_with_code_leaves_original_unchanged() {
        let original = CodeGenerationState::new(URL).with_ticket_content("Add a button");
        let snapshot = original.clone();

        let updated = original.with_code("function run() {}", Some("run".into()), None);

        assert_eq!(original, snapshot);
        assert_eq!(original.generated_code(), None);
        assert_eq!(updated.generated_code(), Some("function run() {}"));
        assert_eq!(updated.method_name(), Some("run"));
        assert_eq!(updated.ticket_content(), "Add a button");
    }

    #[test]
    fn test_with_methods_change_only_named_fields() {
        let base = CodeGenerationState::new(URL)
            .with_ticket_content("ticket")
            .with_code("code", Some("m".into()), Some("cmd".into()));

        let cases: Vec<(CodeGenerationState, Vec<&str>)> = vec![
            (base.with_tests("tests"), vec!["generated_tests"]),
            (
                base.with_validation(ValidationResult::passed(90)),
                vec!["validation_results", "validation_history"],
            ),
            (base.with_feedback(json!({"note": "ok"})), vec!["feedback"]),
            (base.with_code("code2", None, None), vec!["generated_code"]),
        ];

        let before = without_trail(&base);
        for (after, changed) in cases {
            let after = without_trail(&after);
            let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                if changed.contains(&key.as_str()) {
                    assert_ne!(before.get(key), after.get(key), "{key} should change");
                } else {
                    assert_eq!(before.get(key), after.get(key), "{key} should not change");
                }
            }
        }
    }

    #[test]
    fn test_with_code_keeps_previous_identifiers() {
        let state = CodeGenerationState::new(URL)
            .with_code("a", Some("first".into()), Some("cmd.first".into()))
            .with_code("b", None, None);
        assert_eq!(state.method_name(), Some("first"));
        assert_eq!(state.command_id(), Some("cmd.first"));
    }

    #[test]
    fn test_validation_history_appends() {
        let state = CodeGenerationState::new(URL)
            .with_validation(ValidationResult::failed(40, vec!["x".into()]))
            .with_validation(ValidationResult::passed(100));

        assert_eq!(state.validation_history().len(), 2);
        assert!(!state.validation_history()[0].success);
        assert_eq!(state.validation().map(|v| v.success), Some(true));
    }

    #[test]
    fn test_audit_trail_is_a_copy() {
        let state = CodeGenerationState::new(URL).with_tests("describe('x', () => {})");
        let mut trail = state.get_audit_trail();
        trail.clear();

        let trail = state.get_audit_trail();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].operation, "with_tests");
        assert_eq!(trail[0].sequence, 0);
        assert_eq!(trail[0].digest.as_deref().map(str::len), Some(64));
    }

    #[test]
    fn test_defaults() {
        let state = CodeGenerationState::default();
        assert_eq!(state.recovery_confidence(), 100.0);
        assert_eq!(state.code_spec().language, "typescript");
        assert_eq!(state.test_spec().framework, "jest");
        assert!(state.get_audit_trail().is_empty());
    }

    #[test]
    fn test_annotations() {
        let state = CodeGenerationState::new(URL).with_annotation("degraded", json!(true));
        assert!(state.is_flagged("degraded"));
        assert!(!state.is_flagged("missing"));
        assert_eq!(state.annotation("degraded"), Some(&json!(true)));
    }

    #[test]
    fn test_cleared_resets_outputs() {
        let state = CodeGenerationState::new(URL)
            .with_code("code", None, None)
            .with_tests("tests")
            .with_annotation("review_skipped", json!(true));
        let cleared = state.cleared(&["generated_code", "review_skipped"]);

        assert_eq!(cleared.generated_code(), None);
        assert_eq!(cleared.generated_tests(), Some("tests"));
        assert!(cleared.annotation("review_skipped").is_none());
        assert_eq!(state.generated_code(), Some("code"));
        assert_eq!(cleared.get_audit_trail().last().map(|e| e.operation.as_str()), Some("cleared"));
    }
}
