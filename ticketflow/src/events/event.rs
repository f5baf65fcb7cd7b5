//! The structured event record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Severity of a structured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal milestones.
    Info,
    /// Degraded but continuing.
    Warn,
    /// Failures.
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A structured log event: `{timestamp, level, event, component, ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredEvent {
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: EventLevel,
    /// Event name, e.g. `stage_started`.
    pub event: String,
    /// Emitting component, e.g. `stage` or `error_recovery`.
    pub component: String,
    /// Event-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StructuredEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(level: EventLevel, event: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            event: event.into(),
            component: component.into(),
            fields: Map::new(),
        }
    }

    /// Creates an info-level event.
    #[must_use]
    pub fn info(event: impl Into<String>, component: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, event, component)
    }

    /// Creates a warn-level event.
    #[must_use]
    pub fn warn(event: impl Into<String>, component: impl Into<String>) -> Self {
        Self::new(EventLevel::Warn, event, component)
    }

    /// Creates an error-level event.
    #[must_use]
    pub fn error(event: impl Into<String>, component: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, event, component)
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns a field value.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Renders the flat JSON form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
