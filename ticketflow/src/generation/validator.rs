//! Cross-validation of generated code against generated tests.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use super::ValidationJudge;
use crate::state::{CodeGenerationState, ValidationResult};

static METHOD_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?:public|private|protected)?\s*(?:async)?\s*(\w+)\s*\(").ok()
});

static TESTED_METHOD_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\.(\w+)\(").ok());

const NOT_METHODS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "function", "constructor",
];

const ISSUE_PENALTY: usize = 20;

/// Names that look like method or function definitions in `code`, in order
/// of first appearance.
#[must_use]
pub fn extract_methods(code: &str) -> Vec<String> {
    let Some(pattern) = METHOD_PATTERN.as_ref() else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    pattern
        .captures_iter(code)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .filter(|name| !NOT_METHODS.contains(name))
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

/// Names called as methods (`.name(`) anywhere in `tests`.
#[must_use]
pub fn extract_tested_methods(tests: &str) -> BTreeSet<String> {
    TESTED_METHOD_PATTERN
        .as_ref()
        .map(|pattern| {
            pattern
                .captures_iter(tests)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Turns validation issues into instructions for the generators.
#[must_use]
pub fn refinement_directives(issues: &[String]) -> Vec<String> {
    issues
        .iter()
        .map(|issue| {
            let lower = issue.to_lowercase();
            if lower.contains("untested methods") {
                "Add test cases for all public methods in the generated code.".to_string()
            } else if lower.contains("describe") {
                "Structure tests with proper describe blocks.".to_string()
            } else if lower.contains("test cases") {
                "Add specific test cases (it/test blocks) for the functionality.".to_string()
            } else if lower.contains("do not reference") {
                "Ensure tests properly reference the generated method and command ID.".to_string()
            } else {
                format!("Fix: {issue}")
            }
        })
        .collect()
}

/// Structural checks plus an optional external judge.
#[derive(Clone, Default)]
pub struct CrossValidator {
    judge: Option<Arc<dyn ValidationJudge>>,
}

impl CrossValidator {
    /// A validator running the structural checks only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an external judge whose verdict must also pass.
    #[must_use]
    pub fn with_judge(mut self, judge: Arc<dyn ValidationJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Checks that code and tests fit together without consulting the judge.
    ///
    /// Every extracted method must be called by the tests, the tests must use
    /// `describe` and `it`/`test`, and a declared method name or command id
    /// must appear in the tests. Each issue costs 20 points.
    #[must_use]
    pub fn structural(state: &CodeGenerationState) -> ValidationResult {
        let code = state.generated_code().unwrap_or_default();
        let tests = state.generated_tests().unwrap_or_default();
        let mut issues = Vec::new();

        if code.trim().is_empty() {
            issues.push("No generated code to validate".to_string());
        }
        if tests.trim().is_empty() {
            issues.push("No generated tests to validate".to_string());
        }

        let tested = extract_tested_methods(tests);
        let untested: Vec<String> = extract_methods(code)
            .into_iter()
            .filter(|m| !tested.contains(m))
            .collect();
        if !untested.is_empty() {
            issues.push(format!("Untested methods: {}", untested.join(", ")));
        }

        if let Some(method) = state.method_name() {
            if !tests.contains(method) {
                issues.push(format!("Tests do not reference method '{method}'"));
            }
        }
        if let Some(command) = state.command_id() {
            if !tests.contains(command) {
                issues.push(format!("Tests do not reference command ID '{command}'"));
            }
        }

        if !tests.contains("describe(") {
            issues.push("Tests missing describe blocks".to_string());
        }
        if !tests.contains("it(") && !tests.contains("test(") {
            issues.push("Tests missing test cases".to_string());
        }

        let score = u8::try_from(100usize.saturating_sub(issues.len() * ISSUE_PENALTY)).unwrap_or(0);
        if issues.is_empty() {
            ValidationResult::passed(score)
        } else {
            ValidationResult::failed(score, issues)
        }
    }

    /// Runs the structural checks and, if configured, the judge.
    ///
    /// Both must pass; the score is the lower of the two. A judge that
    /// cannot be reached leaves the structural verdict in place.
    pub async fn validate(&self, state: &CodeGenerationState) -> ValidationResult {
        let structural = Self::structural(state);
        let Some(judge) = &self.judge else {
            return structural;
        };

        match judge.judge(state).await {
            Ok(verdict) => {
                debug!(score = verdict.score, success = verdict.success, "Judge verdict");
                let mut issues = structural.issues;
                issues.extend(verdict.issues);
                let mut recommendations = structural.recommendations;
                recommendations.extend(verdict.recommendations);
                let score = structural.score.min(verdict.score);
                let result = if structural.success && verdict.success {
                    ValidationResult::passed(score)
                } else {
                    ValidationResult::failed(score, issues)
                };
                result.with_recommendations(recommendations)
            }
            Err(e) => {
                warn!(error = %e, "Validation judge unavailable, using structural checks only");
                structural
            }
        }
    }
}

impl std::fmt::Debug for CrossValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossValidator")
            .field("has_judge", &self.judge.is_some())
            .finish()
    }
}
