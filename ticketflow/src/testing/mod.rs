//! Testing utilities for ticketflow workflows.
//!
//! This module provides:
//! - Stage doubles for composing test workflows
//! - A settable health probe
//! - Sample inputs and states

mod fixtures;
mod mocks;

pub use fixtures::{input_for, sample_input, sample_issue_url, sample_state};
pub use mocks::{
    FailingStage, FieldStage, MockStage, RecordingStage, SlowStage, StaticProbe, EXECUTION_ORDER,
};
