//! Recovery strategies and the ordered classification table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ErrorKind;

/// How the engine tries to get a failed run back on track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    /// Re-attempt once dependent services are healthy.
    Retry,
    /// Produce a minimal stand-in output.
    Fallback,
    /// Disable the feature for this run.
    Degradation,
    /// Mark the feature skipped.
    Skip,
    /// Inject a labelled placeholder.
    Substitute,
    /// Rebuild a minimal valid state from salvageable fields.
    StateRecovery,
}

impl RecoveryStrategy {
    /// The chained strategies, in evaluation order.
    pub const CHAIN: [Self; 5] = [
        Self::Retry,
        Self::Fallback,
        Self::Degradation,
        Self::Skip,
        Self::Substitute,
    ];

    /// Upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "RETRY",
            Self::Fallback => "FALLBACK",
            Self::Degradation => "DEGRADATION",
            Self::Skip => "SKIP",
            Self::Substitute => "SUBSTITUTE",
            Self::StateRecovery => "STATE_RECOVERY",
        }
    }

    /// The strategies evaluated when classification picks `self`.
    ///
    /// The chain starts at the classified strategy and continues in
    /// [`Self::CHAIN`] order. STATE_RECOVERY is never chained.
    #[must_use]
    pub fn chain_from(self) -> &'static [Self] {
        match Self::CHAIN.iter().position(|s| *s == self) {
            Some(start) => &Self::CHAIN[start..],
            None => &[],
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    /// Error kinds the rule matches.
    pub kinds: &'static [ErrorKind],
    /// Strategy chosen on match.
    pub strategy: RecoveryStrategy,
}

/// Ordered error-kind to strategy table. First match wins; anything
/// unmatched is skipped.
pub const CLASSIFICATION_TABLE: &[ClassificationRule] = &[
    ClassificationRule {
        kinds: &[ErrorKind::Timeout, ErrorKind::Connection, ErrorKind::ServiceUnavailable],
        strategy: RecoveryStrategy::Retry,
    },
    ClassificationRule {
        kinds: &[ErrorKind::CircuitOpen],
        strategy: RecoveryStrategy::Degradation,
    },
    ClassificationRule {
        kinds: &[ErrorKind::Validation, ErrorKind::Llm, ErrorKind::Parse],
        strategy: RecoveryStrategy::Substitute,
    },
    ClassificationRule {
        kinds: &[ErrorKind::KeyAccess, ErrorKind::TypeMismatch],
        strategy: RecoveryStrategy::StateRecovery,
    },
];

/// Classifies an error kind with [`CLASSIFICATION_TABLE`].
#[must_use]
pub fn classify(kind: ErrorKind) -> RecoveryStrategy {
    CLASSIFICATION_TABLE
        .iter()
        .find(|rule| rule.kinds.contains(&kind))
        .map_or(RecoveryStrategy::Skip, |rule| rule.strategy)
}
