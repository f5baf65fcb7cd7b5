//! Input contract checked before a workflow runs.

use regex::Regex;
use serde_json::Value;

use crate::config::ContractSettings;
use crate::errors::{ContractErrorInfo, FlowError, FlowResult, ValidationError};
use crate::state::{keys, CodeGenerationState, StateMap};

/// Required keys plus a well-formed identifier.
#[derive(Debug, Clone)]
pub struct InputContract {
    required: Vec<String>,
    identifier_key: String,
    pattern: Regex,
}

impl InputContract {
    /// A contract requiring `url` to match `pattern`.
    pub fn new(pattern: &str) -> FlowResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| FlowError::Config(format!("invalid identifier pattern: {e}")))?;
        Ok(Self {
            required: vec![keys::URL.to_string()],
            identifier_key: keys::URL.to_string(),
            pattern,
        })
    }

    /// A contract from configuration.
    pub fn from_settings(settings: &ContractSettings) -> FlowResult<Self> {
        Self::new(&settings.identifier_pattern)
    }

    /// Adds another required key.
    #[must_use]
    pub fn with_required(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.required.contains(&key) {
            self.required.push(key);
        }
        self
    }

    /// The identifier of an input, if present and a string.
    pub fn identifier<'a>(&self, input: &'a StateMap) -> Option<&'a str> {
        input.get(&self.identifier_key).and_then(Value::as_str)
    }

    /// Checks an input mapping.
    pub fn validate(&self, input: &StateMap) -> Result<(), ValidationError> {
        for key in &self.required {
            if input.get(key).map_or(true, Value::is_null) {
                return Err(ValidationError::new(format!("missing required input '{key}'"))
                    .with_field(key.clone())
                    .with_error_info(
                        ContractErrorInfo::new("CONTRACT-001-MISSING_KEY", "Required input key missing")
                            .with_fix_hint(format!("Provide '{key}' in the workflow input."))
                            .with_context_entry("key", key.clone()),
                    ));
            }
        }

        let identifier = self.identifier(input).unwrap_or_default();
        if !self.pattern.is_match(identifier) {
            return Err(ValidationError::new(format!(
                "malformed identifier '{}': expected {}",
                input.get(&self.identifier_key).unwrap_or(&Value::Null),
                self.pattern.as_str()
            ))
            .with_field(self.identifier_key.clone())
            .with_error_info(
                ContractErrorInfo::new("CONTRACT-002-MALFORMED_ID", "Identifier is not well-formed")
                    .with_fix_hint("Pass the full issue URL, e.g. https://github.com/owner/repo/issues/1.")
                    .with_context_entry("pattern", self.pattern.as_str()),
            ));
        }
        Ok(())
    }

    /// Validates an input and builds the initial state from it.
    pub fn initial_state(&self, input: &StateMap) -> FlowResult<CodeGenerationState> {
        self.validate(input)?;
        CodeGenerationState::from_mapping(input).map_err(|e| {
            ValidationError::new(format!("input does not describe a state: {e}"))
                .with_error_info(ContractErrorInfo::new(
                    "CONTRACT-001-BAD_SHAPE",
                    "Input fields have the wrong shape",
                ))
                .into()
        })
    }
}

/// Issue number at the end of an issue URL.
#[must_use]
pub fn issue_number(url: &str) -> Option<&str> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|last| !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()))
}
