//! Metrics, run tracking and logging setup.
//!
//! [`Monitor`] owns the in-process metrics and workflow tracker.
//! [`Telemetry`] pairs a monitor with an [`EventSink`] and is what breakers,
//! stages, the recovery engine and the workflow manager hold.

mod logging;
mod metrics;
mod tracker;

pub use logging::init_tracing;
pub use metrics::{metric_key, MetricsSnapshot, MetricsStore, TimerSummary};
pub use tracker::{RunStatus, StepRecord, WorkflowMetrics, WorkflowRun, WorkflowTracker};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::events::{EventSink, NoOpEventSink, StructuredEvent, TracingEventSink};

/// Serializable view of everything the monitor knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Counters, timers and gauges.
    pub metrics: MetricsSnapshot,
    /// Aggregate workflow statistics.
    pub workflows: WorkflowMetrics,
    /// Runs still executing.
    pub active_runs: Vec<WorkflowRun>,
    /// The ten most recent finished runs, newest first.
    pub recent_runs: Vec<WorkflowRun>,
}

/// Metrics store plus workflow tracker.
#[derive(Debug, Default)]
pub struct Monitor {
    metrics: MetricsStore,
    workflows: WorkflowTracker,
}

impl Monitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The metrics store.
    #[must_use]
    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    /// The workflow tracker.
    #[must_use]
    pub fn workflows(&self) -> &WorkflowTracker {
        &self.workflows
    }

    /// Takes a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MonitoringSnapshot {
        MonitoringSnapshot {
            timestamp: Utc::now(),
            metrics: self.metrics.snapshot(),
            workflows: self.workflows.metrics(),
            active_runs: self.workflows.active_runs(),
            recent_runs: self.workflows.recent_runs(10),
        }
    }
}

/// Event sink and monitor shared by the components of a run.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn EventSink>,
    monitor: Arc<Monitor>,
}

impl Telemetry {
    /// Creates telemetry from a sink and a monitor.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, monitor: Arc<Monitor>) -> Self {
        Self { sink, monitor }
    }

    /// Telemetry that logs through `tracing` into a fresh monitor.
    #[must_use]
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingEventSink::new()), Arc::new(Monitor::new()))
    }

    /// Telemetry that discards events into a fresh monitor.
    #[must_use]
    pub fn silent() -> Self {
        Self::new(Arc::new(NoOpEventSink), Arc::new(Monitor::new()))
    }

    /// Emits an event without blocking.
    pub fn emit(&self, event: StructuredEvent) {
        self.sink.try_emit(event);
    }

    /// The shared monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Shortcut to the monitor's metrics store.
    #[must_use]
    pub fn metrics(&self) -> &MetricsStore {
        self.monitor.metrics()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::tracing()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}
