//! # Ticketflow
//!
//! A resilient orchestration core for pipelines that turn an issue ticket
//! into generated, validated and integrated code.
//!
//! Ticketflow provides:
//!
//! - **Immutable state**: every stage returns a new [`state::CodeGenerationState`]
//! - **Circuit breakers and health probes** shared across runs through one
//!   explicitly constructed [`registry::ServiceRegistry`]
//! - **Error recovery**: a data-driven strategy chain for failed stages
//! - **Collaborative generation**: generate, cross-validate and refine code and tests
//! - **Workflows**: sequential stages, parallel groups with a deterministic
//!   merge, contract-checked inputs and bounded batches
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ticketflow::prelude::*;
//!
//! let registry = ServiceRegistry::new(FlowConfig::from_env()?);
//! let composer = StageComposer::new(registry.clone())
//!     .with_recovery(Arc::new(ErrorRecoveryEngine::new(&registry)));
//! composer.register_stage(Arc::new(FetchIssueStage::new(source)));
//! // register the remaining stages ...
//!
//! let manager = WorkflowManager::new(composer)?;
//! install_standard_workflows(&manager)?;
//! let result = manager.execute_workflow("full_workflow", &input).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod circuit;
pub mod config;
pub mod errors;
pub mod events;
pub mod generation;
pub mod health;
pub mod observability;
pub mod recovery;
pub mod registry;
pub mod stages;
pub mod state;
pub mod testing;
pub mod tools;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
    pub use crate::config::FlowConfig;
    pub use crate::errors::{
        BatchProcessingError, CircuitBreakerOpenError, ContractErrorInfo, ErrorKind, FlowError,
        FlowResult, ValidationError, WorkflowError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, NoOpEventSink, StructuredEvent, TracingEventSink};
    pub use crate::generation::{CollaborativeGenerator, CrossValidator};
    pub use crate::health::{HealthMonitor, HealthProbe};
    pub use crate::observability::{init_tracing, Monitor, Telemetry};
    pub use crate::recovery::{ErrorRecoveryEngine, FailureReport, RecoveryStrategy};
    pub use crate::registry::ServiceRegistry;
    pub use crate::stages::{
        CodeExtractorStage, CodeIntegratorStage, CodeReviewerStage, DependencyAnalyzerStage,
        FetchIssueStage, GuardedStage, ImplementationPlannerStage, Stage, StageCategory,
        TestRunnerStage, TicketClarityStage,
    };
    pub use crate::state::{CodeGenerationState, StateMap, ValidationResult};
    pub use crate::tools::{Tool, ToolRegistry};
    pub use crate::workflow::{
        install_standard_workflows, BatchReport, ExecutionGraph, ParallelGroup, StageComposer,
        WorkflowConfig, WorkflowManager,
    };
}
