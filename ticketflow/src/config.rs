//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON document or an environment
//! with no `TICKETFLOW_*` variables yields a working configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::circuit::CircuitBreakerConfig;
use crate::errors::{FlowError, FlowResult};
use crate::recovery::RetryConfig;

/// Default identifier pattern: a GitHub issue URL.
pub const DEFAULT_IDENTIFIER_PATTERN: &str = r"^https://github\.com/[\w.-]+/[\w.-]+/issues/\d+$";

/// Per-resource circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Used for any resource without an override.
    pub default: CircuitBreakerConfig,
    /// Settings by resource name.
    pub overrides: BTreeMap<String, CircuitBreakerConfig>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let overrides = [
            ("ticket_source", 5, 60.0),
            ("reasoning", 3, 30.0),
            ("code_service", 3, 30.0),
            ("compiler", 2, 15.0),
            ("file_system", 3, 10.0),
            ("tool_bridge", 3, 30.0),
        ]
        .into_iter()
        .map(|(name, threshold, secs)| (name.to_string(), CircuitBreakerConfig::new(threshold, secs)))
        .collect();

        Self {
            default: CircuitBreakerConfig::default(),
            overrides,
        }
    }
}

impl BreakerSettings {
    /// Returns the settings for a resource.
    #[must_use]
    pub fn config_for(&self, name: &str) -> CircuitBreakerConfig {
        self.overrides.get(name).cloned().unwrap_or_else(|| self.default.clone())
    }

    /// Sets an override.
    #[must_use]
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// How long a probe result is reused, in seconds. Zero probes on every
    /// query.
    pub cache_ttl_secs: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { cache_ttl_secs: 30.0 }
    }
}

impl HealthSettings {
    /// The cache TTL as a duration.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.cache_ttl_secs.max(0.0))
    }
}

/// Recovery engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Backoff between RETRY attempts.
    pub retry: RetryConfig,
    /// Number of recovery records kept for status reports.
    pub history_limit: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            history_limit: 10,
        }
    }
}

/// Collaborative generation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Maximum generate/validate/refine iterations.
    pub max_refinement_iterations: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_refinement_iterations: 3,
        }
    }
}

/// Batch execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Maximum items executing at once.
    pub max_concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { max_concurrency: 3 }
    }
}

/// Input contract settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractSettings {
    /// Regex every work item identifier must match.
    pub identifier_pattern: String,
}

impl Default for ContractSettings {
    fn default() -> Self {
        Self {
            identifier_pattern: DEFAULT_IDENTIFIER_PATTERN.to_string(),
        }
    }
}

/// External service endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Base URL of the reasoning service.
    pub reasoning_host: String,
    /// Model used for reasoning tasks.
    pub reasoning_model: String,
    /// Model used for code generation.
    pub code_model: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            reasoning_host: "http://localhost:11434".to_string(),
            reasoning_model: "qwen2.5:14b".to_string(),
            code_model: "qwen2.5-coder:14b".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Circuit breakers.
    pub breakers: BreakerSettings,
    /// Health monitor.
    pub health: HealthSettings,
    /// Recovery engine.
    pub recovery: RecoverySettings,
    /// Collaborative generation.
    pub generation: GenerationSettings,
    /// Batch execution.
    pub batch: BatchSettings,
    /// Input contract.
    pub contract: ContractSettings,
    /// External services.
    pub services: ServiceSettings,
    /// Logging.
    pub logging: LoggingConfig,
}

impl FlowConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> FlowResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from defaults overlaid with `TICKETFLOW_*`
    /// environment variables, then validates it.
    pub fn from_env() -> FlowResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`FlowConfig::from_env`] with an explicit variable lookup.
    pub fn from_lookup<F>(lookup: F) -> FlowResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("TICKETFLOW_BREAKER_FAILURE_THRESHOLD") {
            config.breakers.default.failure_threshold = parse_var("TICKETFLOW_BREAKER_FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("TICKETFLOW_BREAKER_RECOVERY_TIMEOUT_SECS") {
            config.breakers.default.recovery_timeout_secs =
                parse_var("TICKETFLOW_BREAKER_RECOVERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TICKETFLOW_HEALTH_CACHE_TTL_SECS") {
            config.health.cache_ttl_secs = parse_var("TICKETFLOW_HEALTH_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("TICKETFLOW_MAX_REFINEMENT_ITERATIONS") {
            config.generation.max_refinement_iterations =
                parse_var("TICKETFLOW_MAX_REFINEMENT_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("TICKETFLOW_BATCH_MAX_CONCURRENCY") {
            config.batch.max_concurrency = parse_var("TICKETFLOW_BATCH_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("TICKETFLOW_IDENTIFIER_PATTERN") {
            config.contract.identifier_pattern = v;
        }
        if let Some(v) = lookup("TICKETFLOW_REASONING_HOST") {
            config.services.reasoning_host = v;
        }
        if let Some(v) = lookup("TICKETFLOW_REASONING_MODEL") {
            config.services.reasoning_model = v;
        }
        if let Some(v) = lookup("TICKETFLOW_CODE_MODEL") {
            config.services.code_model = v;
        }
        if let Some(v) = lookup("TICKETFLOW_LOG") {
            config.logging.filter = v;
        }
        if let Some(v) = lookup("TICKETFLOW_LOG_JSON") {
            config.logging.json = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> FlowResult<()> {
        let breakers = std::iter::once(("default", &self.breakers.default))
            .chain(self.breakers.overrides.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, breaker) in breakers {
            if breaker.failure_threshold == 0 {
                return Err(FlowError::Config(format!(
                    "breaker '{name}': failure_threshold must be at least 1"
                )));
            }
            if !breaker.recovery_timeout_secs.is_finite() || breaker.recovery_timeout_secs < 0.0 {
                return Err(FlowError::Config(format!(
                    "breaker '{name}': recovery_timeout_secs must be a non-negative number"
                )));
            }
        }
        if self.batch.max_concurrency == 0 {
            return Err(FlowError::Config("batch.max_concurrency must be at least 1".into()));
        }
        if self.generation.max_refinement_iterations == 0 {
            return Err(FlowError::Config(
                "generation.max_refinement_iterations must be at least 1".into(),
            ));
        }
        if !self.health.cache_ttl_secs.is_finite() || self.health.cache_ttl_secs < 0.0 {
            return Err(FlowError::Config("health.cache_ttl_secs must be non-negative".into()));
        }
        let host = &self.services.reasoning_host;
        if !(host.starts_with("http://") || host.starts_with("https://")) {
            return Err(FlowError::Config(format!(
                "services.reasoning_host must start with http:// or https://, got '{host}'"
            )));
        }
        Regex::new(&self.contract.identifier_pattern).map_err(|e| {
            FlowError::Config(format!("contract.identifier_pattern is not a valid regex: {e}"))
        })?;
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> FlowResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FlowError::Config(format!("{key}: cannot parse '{value}'")))
}
