//! Workflow composition and execution.
//!
//! A [`WorkflowConfig`] names stages, tools and parallel groups. The
//! [`StageComposer`] turns it into an [`ExecutionGraph`] of breaker-guarded
//! stages, and the [`WorkflowManager`] runs named graphs against the
//! [`InputContract`], alone or as a bounded batch.

pub mod blueprint;
mod composer;
mod config;
mod contract;
mod graph;
mod manager;
mod reducer;


pub use blueprint::install_standard_workflows;
pub use composer::StageComposer;
pub use config::{ParallelGroup, WorkflowConfig, WorkflowStep};
pub use contract::{issue_number, InputContract};
pub use graph::{ExecutionGraph, GraphNode};
pub use manager::{BatchItemResult, BatchReport, WorkflowManager};
pub use reducer::merge_branches;
