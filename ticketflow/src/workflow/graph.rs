//! Executable workflow graphs.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::reducer::merge_branches;
use crate::cancellation::CancellationToken;
use crate::errors::{ErrorKind, FlowError, FlowResult};
use crate::events::StructuredEvent;
use crate::observability::Telemetry;
use crate::recovery::{ErrorRecoveryEngine, FailureReport};
use crate::stages::{GuardedStage, Stage};
use crate::state::{keys, CodeGenerationState};

const COMPONENT: &str = "workflow";

/// One node of a built graph.
#[derive(Debug, Clone)]
pub enum GraphNode {
    /// A guarded stage run on the current state.
    Stage(Arc<GuardedStage>),
    /// Branches run concurrently on copies of the current state, then merged.
    Parallel {
        /// Group name.
        name: String,
        /// Branches in declared order.
        branches: Vec<Vec<Arc<GuardedStage>>>,
    },
}

/// Per-run context shared by the sequential path and every branch task.
#[derive(Clone)]
struct StepRunner {
    workflow: String,
    recovery: Option<Arc<ErrorRecoveryEngine>>,
    telemetry: Telemetry,
    cancel: Arc<CancellationToken>,
    run_id: Option<String>,
}

impl StepRunner {
    fn track(&self, step: &str, status: &str) {
        if let Some(id) = &self.run_id {
            self.telemetry.monitor().workflows().update_step(id, step, status);
        }
    }

    async fn run_stage(
        &self,
        stage: &GuardedStage,
        state: CodeGenerationState,
    ) -> FlowResult<CodeGenerationState> {
        self.cancel.check()?;
        self.track(stage.name(), "running");
        match stage.run(state.clone()).await {
            Ok(next) => {
                self.track(stage.name(), "completed");
                Ok(next)
            }
            Err(err) => {
                self.track(stage.name(), "failed");
                self.recover(stage, &state, err).await
            }
        }
    }

    /// Routes a stage failure through the recovery engine when the graph has
    /// one and the stage has a recovery category.
    async fn recover(
        &self,
        stage: &GuardedStage,
        state: &CodeGenerationState,
        err: FlowError,
    ) -> FlowResult<CodeGenerationState> {
        let (Some(engine), Some(category)) = (&self.recovery, stage.category()) else {
            return Err(err);
        };
        if err.kind() == ErrorKind::Cancelled {
            return Err(err);
        }

        let report = FailureReport::new(category.as_str(), err.clone())
            .with_context("workflow", self.workflow.as_str())
            .with_context("stage", stage.name());
        let recovered = engine.recover_failure(state, &report).await?;
        if recovered.is_flagged(keys::RECOVERY_FAILED) {
            warn!(stage = stage.name(), "Recovery failed, propagating stage error");
            return Err(err);
        }
        self.track(stage.name(), "recovered");
        Ok(recovered)
    }

    async fn run_sequence(
        &self,
        stages: &[Arc<GuardedStage>],
        mut state: CodeGenerationState,
    ) -> FlowResult<CodeGenerationState> {
        for stage in stages {
            state = self.run_stage(stage, state).await?;
        }
        Ok(state)
    }

    async fn run_parallel(
        &self,
        name: &str,
        branches: &[Vec<Arc<GuardedStage>>],
        state: CodeGenerationState,
    ) -> FlowResult<CodeGenerationState> {
        self.cancel.check()?;
        self.telemetry.emit(
            StructuredEvent::info("parallel_started", COMPONENT)
                .with_field("workflow", self.workflow.as_str())
                .with_field("group", name)
                .with_field("branches", branches.len()),
        );

        let handles: Vec<_> = branches
            .iter()
            .map(|branch| {
                let runner = self.clone();
                let branch = branch.clone();
                let fork = state.clone();
                tokio::spawn(async move { runner.run_sequence(&branch, fork).await })
            })
            .collect();

        // Every branch is joined before the first failure is reported.
        let mut outputs = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            let output = joined
                .map_err(|e| FlowError::Internal(format!("parallel branch of '{name}' panicked: {e}")))??;
            outputs.push(output);
        }

        let merged = merge_branches(&state, &outputs)?;
        self.telemetry.emit(
            StructuredEvent::info("parallel_completed", COMPONENT)
                .with_field("workflow", self.workflow.as_str())
                .with_field("group", name),
        );
        Ok(merged)
    }
}

/// A workflow ready to run: guarded stages in order, parallel groups as
/// fork-join nodes, and optional failure recovery.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    name: String,
    nodes: Vec<GraphNode>,
    recovery: Option<Arc<ErrorRecoveryEngine>>,
    telemetry: Telemetry,
}

impl ExecutionGraph {
    /// Creates a graph from built nodes.
    #[must_use]
    pub fn new(name: impl Into<String>, nodes: Vec<GraphNode>, telemetry: Telemetry) -> Self {
        Self {
            name: name.into(),
            nodes,
            recovery: None,
            telemetry,
        }
    }

    /// Routes stage failures through `engine`.
    #[must_use]
    pub fn with_recovery(mut self, engine: Arc<ErrorRecoveryEngine>) -> Self {
        self.recovery = Some(engine);
        self
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the nodes in execution order.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Stage names in declared order, parallel members included.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for node in &self.nodes {
            match node {
                GraphNode::Stage(stage) => names.push(stage.name().to_string()),
                GraphNode::Parallel { branches, .. } => names.extend(
                    branches.iter().flatten().map(|stage| stage.name().to_string()),
                ),
            }
        }
        names
    }

    /// Runs the graph to completion.
    pub async fn execute(&self, state: CodeGenerationState) -> FlowResult<CodeGenerationState> {
        self.execute_with(state, Arc::new(CancellationToken::new()), None)
            .await
    }

    /// Runs the graph, checking `cancel` before each stage and fork and
    /// recording step progress under `run_id` in the workflow tracker.
    pub async fn execute_with(
        &self,
        state: CodeGenerationState,
        cancel: Arc<CancellationToken>,
        run_id: Option<&str>,
    ) -> FlowResult<CodeGenerationState> {
        let runner = StepRunner {
            workflow: self.name.clone(),
            recovery: self.recovery.clone(),
            telemetry: self.telemetry.clone(),
            cancel,
            run_id: run_id.map(str::to_string),
        };

        let start = Instant::now();
        let mut state = state;
        for node in &self.nodes {
            state = match node {
                GraphNode::Stage(stage) => runner.run_stage(stage, state).await?,
                GraphNode::Parallel { name, branches } => {
                    runner.run_parallel(name, branches, state).await?
                }
            };
        }
        debug!(
            workflow = %self.name,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Graph finished"
        );
        info!(workflow = %self.name, nodes = self.nodes.len(), "Workflow graph completed");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerRegistry;
    use crate::config::{BreakerSettings, FlowConfig};
    use crate::events::CollectingEventSink;
    use crate::observability::Monitor;
    use crate::recovery::RetryConfig;
    use crate::registry::ServiceRegistry;
    use crate::stages::{FnStage, StageCategory};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn guard(stage: impl Stage + 'static, breakers: &CircuitBreakerRegistry) -> Arc<GuardedStage> {
        Arc::new(GuardedStage::new(Arc::new(stage), breakers, Telemetry::silent()))
    }

    fn tag(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> impl Stage {
        FnStage::new(name, move |s: CodeGenerationState| {
            log.lock().push(name.to_string());
            Ok(s.with_annotation(name, json!(true)))
        })
    }

    fn state() -> CodeGenerationState {
        CodeGenerationState::new("https://github.com/acme/widgets/issues/3")
    }

    #[tokio::test]
    async fn test_sequential_order() {
        let breakers = CircuitBreakerRegistry::new(BreakerSettings::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = ExecutionGraph::new(
            "seq",
            vec![
                GraphNode::Stage(guard(tag("a", log.clone()), &breakers)),
                GraphNode::Stage(guard(tag("b", log.clone()), &breakers)),
            ],
            Telemetry::silent(),
        );

        let out = graph.execute(state()).await.unwrap();
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert!(out.is_flagged("a") && out.is_flagged("b"));
        assert_eq!(graph.stage_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_parallel_branches_see_fork_state_and_merge() {
        let breakers = CircuitBreakerRegistry::new(BreakerSettings::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let isolated = FnStage::new("c", |s: CodeGenerationState| {
            // Branch "b" runs concurrently; its output must not be visible here.
            assert!(s.annotation("b").is_none());
            Ok(s.with_annotation("c", json!(true)))
        });
        let graph = ExecutionGraph::new(
            "fork",
            vec![
                GraphNode::Stage(guard(tag("a", log.clone()), &breakers)),
                GraphNode::Parallel {
                    name: "group".into(),
                    branches: vec![
                        vec![guard(tag("b", log.clone()), &breakers)],
                        vec![guard(isolated, &breakers)],
                    ],
                },
                GraphNode::Stage(guard(tag("d", log.clone()), &breakers)),
            ],
            Telemetry::silent(),
        );

        let out = graph.execute(state()).await.unwrap();
        for key in ["a", "b", "c", "d"] {
            assert!(out.is_flagged(key), "{key} missing");
        }
        assert_eq!(log.lock().last().map(String::as_str), Some("d"));
    }

    #[tokio::test]
    async fn test_failing_branch_fails_graph() {
        let breakers = CircuitBreakerRegistry::new(BreakerSettings::default());
        let failing = FnStage::new("bad", |_s: CodeGenerationState| {
            Err(FlowError::Parse("bad answer".into()))
        });
        let graph = ExecutionGraph::new(
            "fork",
            vec![GraphNode::Parallel {
                name: "group".into(),
                branches: vec![
                    vec![guard(tag("ok", Arc::default()), &breakers)],
                    vec![guard(failing, &breakers)],
                ],
            }],
            Telemetry::silent(),
        );
        assert_eq!(graph.execute(state()).await.unwrap_err().kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_cancellation_stops_scheduling() {
        let breakers = CircuitBreakerRegistry::new(BreakerSettings::default());
        let cancel = Arc::new(CancellationToken::new());
        let trigger = cancel.clone();
        let first = FnStage::new("first", move |s: CodeGenerationState| {
            trigger.cancel("operator stop");
            Ok(s)
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = ExecutionGraph::new(
            "cancel",
            vec![
                GraphNode::Stage(guard(first, &breakers)),
                GraphNode::Stage(guard(tag("second", log.clone()), &breakers)),
            ],
            Telemetry::silent(),
        );

        let err = graph.execute_with(state(), cancel, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failure_routed_to_recovery() {
        let sink = Arc::new(CollectingEventSink::new());
        let telemetry = Telemetry::new(sink.clone(), Arc::new(Monitor::new()));
        let mut config = FlowConfig::default();
        config.recovery.retry = RetryConfig::immediate();
        let registry = ServiceRegistry::with_telemetry(config, telemetry.clone());
        let engine = Arc::new(ErrorRecoveryEngine::new(&registry));

        let reviewer = FnStage::new("reviewer", |_s: CodeGenerationState| {
            Err(FlowError::Internal("crashed".into()))
        })
        .with_category(StageCategory::CodeReviewer);
        let graph = ExecutionGraph::new(
            "review",
            vec![GraphNode::Stage(Arc::new(GuardedStage::new(
                Arc::new(reviewer),
                registry.breakers(),
                telemetry.clone(),
            )))],
            telemetry,
        )
        .with_recovery(engine);

        let out = graph.execute(state()).await.unwrap();
        assert!(out.is_flagged(keys::RECOVERY_APPLIED));
        assert_eq!(out.annotation(keys::SKIPPED_FEATURES), Some(&json!(["code_review"])));
        assert_eq!(sink.events_named("stage_failed").len(), 1);
        assert_eq!(sink.events_named("recovery_success").len(), 1);
    }

    #[tokio::test]
    async fn test_uncategorized_failure_propagates() {
        let registry = ServiceRegistry::with_telemetry(FlowConfig::default(), Telemetry::silent());
        let engine = Arc::new(ErrorRecoveryEngine::new(&registry));
        let failing = FnStage::new("plain", |_s: CodeGenerationState| {
            Err(FlowError::Timeout("slow".into()))
        });
        let graph = ExecutionGraph::new(
            "plain",
            vec![GraphNode::Stage(guard(failing, registry.breakers()))],
            Telemetry::silent(),
        )
        .with_recovery(engine);
        assert_eq!(graph.execute(state()).await.unwrap_err().kind(), ErrorKind::Timeout);
    }
}
