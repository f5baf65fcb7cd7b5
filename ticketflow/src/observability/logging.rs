//! Installation of the global `tracing` subscriber.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Installs a `tracing-subscriber` registry configured from `config`.
///
/// `RUST_LOG` overrides the configured filter when set. Only the first call
/// has an effect; the return value reports whether this process's
/// subscriber was installed by ticketflow (false when another subscriber was
/// already set globally).
pub fn init_tracing(config: &LoggingConfig) -> bool {
    *LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

        let layer = if config.json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(false)
                .boxed()
        } else {
            fmt::layer().with_target(true).with_level(true).boxed()
        };

        let installed = tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_ok();

        if installed {
            tracing::debug!(filter = %config.filter, json = config.json, "Structured logging initialized");
        }
        installed
    })
}
