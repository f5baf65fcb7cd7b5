//! Error classification and recovery.
//!
//! When a stage fails, its state is annotated with the failure and handed to
//! [`ErrorRecoveryEngine::recover`], which walks a chain of
//! [`RecoveryStrategy`] values until one produces a usable state.

mod backoff;
mod catalog;
mod engine;
mod strategy;

pub use backoff::{BackoffStrategy, JitterStrategy, RetryConfig, RetryState};
pub use catalog::{
    salvage_state, RecoveryProfile, FALLBACK_CODE, FALLBACK_TESTS, SUBSTITUTE_CODE,
    SUBSTITUTE_TESTS,
};
pub use engine::{
    ErrorRecoveryEngine, FailureReport, RecoveryRecord, RecoveryStatus, RECOVERY_BREAKER,
};
pub use strategy::{classify, ClassificationRule, RecoveryStrategy, CLASSIFICATION_TABLE};
