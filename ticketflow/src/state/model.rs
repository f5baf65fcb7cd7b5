//! Value types carried inside the state.

use serde::{Deserialize, Serialize};

/// Structured ticket details produced by the clarity and planning stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketDetails {
    /// Ticket title.
    pub title: String,
    /// Ticket description.
    pub description: String,
    /// Functional requirements.
    pub requirements: Vec<String>,
    /// Acceptance criteria.
    pub acceptance_criteria: Vec<String>,
    /// Ordered implementation steps.
    pub implementation_steps: Vec<String>,
    /// Packages the implementation is expected to use.
    #[serde(alias = "npm_packages")]
    pub packages: Vec<String>,
    /// Notes for work that cannot be generated.
    pub manual_implementation_notes: String,
}

impl TicketDetails {
    /// Creates ticket details with a title and description.
    #[must_use]
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Best-effort details from unstructured ticket text: the first
    /// non-empty line (without heading markers) becomes the title and the
    /// description keeps at most 200 characters.
    #[must_use]
    pub fn from_raw_text(text: &str) -> Self {
        let title = text
            .lines()
            .map(|l| l.trim().trim_start_matches('#').trim())
            .find(|l| !l.is_empty())
            .unwrap_or("Untitled")
            .to_string();
        let description: String = text.trim().chars().take(200).collect();
        Self::new(title, description)
    }

    /// Sets the requirements.
    #[must_use]
    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    /// Sets the acceptance criteria.
    #[must_use]
    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    /// Sets the implementation steps.
    #[must_use]
    pub fn with_implementation_steps(mut self, steps: Vec<String>) -> Self {
        self.implementation_steps = steps;
        self
    }

    /// Sets the package list.
    #[must_use]
    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }
}

/// Target language settings for generated code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeSpec {
    /// Implementation language.
    pub language: String,
    /// Framework, if any.
    pub framework: Option<String>,
    /// Dependencies the generated code may import.
    pub dependencies: Vec<String>,
}

impl Default for CodeSpec {
    fn default() -> Self {
        Self {
            language: "typescript".to_string(),
            framework: None,
            dependencies: Vec::new(),
        }
    }
}

/// Settings for generated tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSpec {
    /// Test framework.
    pub framework: String,
    /// Kind of tests (unit, integration, ...).
    pub test_type: String,
}

impl Default for TestSpec {
    fn default() -> Self {
        Self {
            framework: "jest".to_string(),
            test_type: "unit".to_string(),
        }
    }
}

/// A source file loaded as context for generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevantFile {
    /// Path relative to the project root.
    #[serde(alias = "file_path")]
    pub path: String,
    /// File content.
    #[serde(default)]
    pub content: String,
}

impl RelevantFile {
    /// Creates a relevant file entry.
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Outcome of one cross-validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationResult {
    /// Whether code and tests were judged consistent.
    pub success: bool,
    /// Score from 0 to 100.
    pub score: u8,
    /// Problems found.
    pub issues: Vec<String>,
    /// Suggested improvements.
    pub recommendations: Vec<String>,
}

impl ValidationResult {
    /// A passing result with the given score.
    #[must_use]
    pub fn passed(score: u8) -> Self {
        Self {
            success: true,
            score: score.min(100),
            issues: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    /// A failing result with the given score and issues.
    #[must_use]
    pub fn failed(score: u8, issues: Vec<String>) -> Self {
        Self {
            success: false,
            score: score.min(100),
            issues,
            recommendations: Vec::new(),
        }
    }

    /// Sets the recommendations.
    #[must_use]
    pub fn with_recommendations(mut self, recommendations: Vec<String>) -> Self {
        self.recommendations = recommendations;
        self
    }
}

/// Results of running the existing and generated test suites.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestOutcome {
    /// Number of passing tests.
    pub passed: u32,
    /// Number of failing tests.
    pub failed: u32,
    /// Failure messages.
    pub errors: Vec<String>,
    /// Where the harness wrote its log.
    pub log_path: Option<String>,
}
