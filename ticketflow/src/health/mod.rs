//! Health monitoring of external dependencies.

mod monitor;
mod probe;

pub use monitor::{HealthMonitor, ServiceStatus};
pub use probe::{FnProbe, HealthProbe};
