//! The immutable state threaded through every pipeline stage.
//!
//! [`CodeGenerationState`] is the canonical, strongly typed record. Stages
//! that need the loosely typed form (the recovery engine, parallel merges)
//! convert through [`CodeGenerationState::to_mapping`] and
//! [`CodeGenerationState::from_mapping`].

mod adapters;
mod container;
pub mod keys;
mod model;

pub use adapters::StateMap;
pub use container::{AuditEntry, CodeGenerationState};
pub use model::{CodeSpec, RelevantFile, TestOutcome, TestSpec, TicketDetails, ValidationResult};
