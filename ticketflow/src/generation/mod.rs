//! Collaborative code and test generation.
//!
//! [`CollaborativeGenerator`] produces code, then tests for that code, then
//! cross-validates the pair and refines it until validation passes or the
//! iteration budget runs out.

mod collaborative;
mod reasoning;
mod validator;

use async_trait::async_trait;

use crate::errors::FlowResult;
use crate::state::{CodeGenerationState, ValidationResult};

pub use collaborative::{CollaborativeGenerator, COLLABORATIVE_GENERATOR};
pub use reasoning::{ReasoningCodeGenerator, ReasoningJudge, ReasoningTestGenerator};
pub use validator::{extract_methods, extract_tested_methods, refinement_directives, CrossValidator};

/// Code produced by a [`CodeGenerator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedCode {
    /// Source text.
    pub code: String,
    /// Main method the code adds, if any.
    pub method_name: Option<String>,
    /// Command or hook identifier the code registers, if any.
    pub command_id: Option<String>,
}

impl GeneratedCode {
    /// Code without method or command metadata.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            method_name: None,
            command_id: None,
        }
    }

    /// Sets the method name.
    #[must_use]
    pub fn with_method_name(mut self, name: impl Into<String>) -> Self {
        self.method_name = Some(name.into());
        self
    }

    /// Sets the command identifier.
    #[must_use]
    pub fn with_command_id(mut self, id: impl Into<String>) -> Self {
        self.command_id = Some(id.into());
        self
    }
}

/// Writes implementation code for the ticket in a state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// First attempt from the ticket and structural context.
    async fn generate(&self, state: &CodeGenerationState) -> FlowResult<GeneratedCode>;

    /// Revises the state's current code following `directives`.
    async fn refine(
        &self,
        state: &CodeGenerationState,
        directives: &[String],
    ) -> FlowResult<GeneratedCode>;
}

/// Writes tests for the code in a state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TestGenerator: Send + Sync {
    /// First attempt from the generated code.
    async fn generate(&self, state: &CodeGenerationState) -> FlowResult<String>;

    /// Revises the state's current tests following `directives`.
    async fn refine(&self, state: &CodeGenerationState, directives: &[String])
        -> FlowResult<String>;
}

/// An external opinion on whether code and tests fit together.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValidationJudge: Send + Sync {
    /// Judges the generated code and tests of a state.
    async fn judge(&self, state: &CodeGenerationState) -> FlowResult<ValidationResult>;
}
