//! Tracking of active and recently finished workflow runs.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

const COMPLETED_CAPACITY: usize = 100;

/// Lifecycle status of a tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// A step reported by a running workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name.
    pub name: String,
    /// Free-form status (`started`, `completed`, ...).
    pub status: String,
    /// When the step was reported.
    pub at: DateTime<Utc>,
}

/// One tracked workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run identifier.
    pub id: String,
    /// Workflow name.
    pub workflow_type: String,
    /// Current status.
    pub status: RunStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, once finished.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock duration, once finished.
    pub duration_ms: Option<f64>,
    /// Steps in report order.
    pub steps: Vec<StepRecord>,
    /// Failure message, for failed runs.
    pub error: Option<String>,
}

/// Aggregate workflow statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    /// Runs seen (active plus retained finished runs).
    pub total: usize,
    /// Runs currently executing.
    pub active: usize,
    /// Retained successful runs.
    pub completed: usize,
    /// Retained failed runs.
    pub failed: usize,
    /// Share of finished runs that succeeded, from 0 to 1.
    pub success_rate: f64,
    /// Share of finished runs that failed, from 0 to 1.
    pub failure_rate: f64,
    /// Mean duration of finished runs.
    pub avg_duration_ms: f64,
}

/// Tracks active runs and the most recent finished ones.
#[derive(Debug, Default)]
pub struct WorkflowTracker {
    active: Mutex<HashMap<String, WorkflowRun>>,
    finished: Mutex<VecDeque<WorkflowRun>>,
}

impl WorkflowTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a run. Restarting an active id replaces it.
    pub fn start(&self, id: impl Into<String>, workflow_type: impl Into<String>) {
        let id = id.into();
        let run = WorkflowRun {
            id: id.clone(),
            workflow_type: workflow_type.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            steps: Vec::new(),
            error: None,
        };
        self.active.lock().insert(id, run);
    }

    /// Records a step of an active run. Unknown ids are ignored.
    pub fn update_step(&self, id: &str, step: impl Into<String>, status: impl Into<String>) {
        if let Some(run) = self.active.lock().get_mut(id) {
            run.steps.push(StepRecord {
                name: step.into(),
                status: status.into(),
                at: Utc::now(),
            });
        }
    }

    /// Marks a run completed.
    pub fn complete(&self, id: &str) {
        self.finish(id, RunStatus::Completed, None);
    }

    /// Marks a run failed.
    pub fn fail(&self, id: &str, error: impl Into<String>) {
        self.finish(id, RunStatus::Failed, Some(error.into()));
    }

    fn finish(&self, id: &str, status: RunStatus, error: Option<String>) {
        let Some(mut run) = self.active.lock().remove(id) else {
            return;
        };
        let ended_at = Utc::now();
        #[allow(clippy::cast_precision_loss)]
        let duration_ms = (ended_at - run.started_at).num_microseconds().unwrap_or(0) as f64 / 1000.0;
        run.status = status;
        run.ended_at = Some(ended_at);
        run.duration_ms = Some(duration_ms);
        run.error = error;

        let mut finished = self.finished.lock();
        finished.push_back(run);
        while finished.len() > COMPLETED_CAPACITY {
            finished.pop_front();
        }
    }

    /// Returns a run by id, active or retained.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<WorkflowRun> {
        if let Some(run) = self.active.lock().get(id) {
            return Some(run.clone());
        }
        self.finished.lock().iter().rev().find(|r| r.id == id).cloned()
    }

    /// Returns the active runs.
    #[must_use]
    pub fn active_runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<_> = self.active.lock().values().cloned().collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    /// Returns up to `limit` finished runs, newest first.
    #[must_use]
    pub fn recent_runs(&self, limit: usize) -> Vec<WorkflowRun> {
        self.finished.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Computes aggregate statistics.
    #[must_use]
    pub fn metrics(&self) -> WorkflowMetrics {
        let active = self.active.lock().len();
        let finished = self.finished.lock();
        let completed = finished.iter().filter(|r| r.status == RunStatus::Completed).count();
        let failed = finished.len() - completed;
        let done = finished.len();

        #[allow(clippy::cast_precision_loss)]
        let (success_rate, failure_rate, avg_duration_ms) = if done == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let total_ms: f64 = finished.iter().filter_map(|r| r.duration_ms).sum();
            (
                completed as f64 / done as f64,
                failed as f64 / done as f64,
                total_ms / done as f64,
            )
        };

        WorkflowMetrics {
            total: active + done,
            active,
            completed,
            failed,
            success_rate,
            failure_rate,
            avg_duration_ms,
        }
    }
}
