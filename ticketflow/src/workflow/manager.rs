//! Named workflows, contract-checked execution and bounded batches.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use super::composer::StageComposer;
use super::config::WorkflowConfig;
use super::contract::{issue_number, InputContract};
use super::graph::ExecutionGraph;
use crate::cancellation::CancellationToken;
use crate::errors::{BatchProcessingError, FlowError, FlowResult, WorkflowError};
use crate::events::StructuredEvent;
use crate::observability::Telemetry;
use crate::state::{CodeGenerationState, StateMap};

const COMPONENT: &str = "workflow_manager";

/// Outcome of one batch item. Exactly one of `output` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// Position in the input list.
    pub index: usize,
    /// The item's identifier.
    pub identifier: String,
    /// The result mapping of a successful run.
    pub output: Option<Value>,
    /// The diagnostic mapping of a failed run.
    pub error: Option<Map<String, Value>>,
}

impl BatchItemResult {
    /// Returns true if the item's run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Ledger of a batch run; `results` holds one entry per input, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Number of inputs.
    pub total: usize,
    /// Items that completed.
    pub successful: usize,
    /// Items that failed.
    pub failed: usize,
    /// Per-item outcomes.
    pub results: Vec<BatchItemResult>,
}

/// Registers named workflows and executes them against the input contract.
#[derive(Debug)]
pub struct WorkflowManager {
    composer: StageComposer,
    workflows: RwLock<BTreeMap<String, Arc<ExecutionGraph>>>,
    contract: InputContract,
    telemetry: Telemetry,
    max_concurrency: usize,
}

/// `workflow_<issue>_<uuid>`, or `workflow_<uuid>` without an issue number.
///
/// Unique per call so that runs of one issue, from one manager or several
/// sharing a monitor, never overwrite each other in the tracker.
fn run_id(issue_url: &str) -> String {
    let unique = Uuid::new_v4().simple();
    issue_number(issue_url).map_or_else(
        || format!("workflow_{unique}"),
        |number| format!("workflow_{number}_{unique}"),
    )
}

/// Runs one contract-checked state through `graph`, tracked under `run_id`.
async fn run_tracked(
    graph: Arc<ExecutionGraph>,
    telemetry: Telemetry,
    state: CodeGenerationState,
    cancel: Arc<CancellationToken>,
    run_id: String,
) -> FlowResult<Value> {
    let workflow = graph.name().to_string();
    let issue_url = state.issue_url().to_string();
    let tracker = telemetry.monitor().workflows();

    tracker.start(&run_id, &workflow);
    telemetry.emit(
        StructuredEvent::info("workflow_started", COMPONENT)
            .with_field("workflow", workflow.as_str())
            .with_field("run_id", run_id.as_str())
            .with_field("issue_url", issue_url.as_str()),
    );

    let outcome = match graph.execute_with(state, cancel, Some(&run_id)).await {
        Ok(done) => done.to_mapping(),
        Err(err) => Err(err),
    };

    match outcome {
        Ok(mapping) => {
            tracker.complete(&run_id);
            telemetry.emit(
                StructuredEvent::info("workflow_completed", COMPONENT)
                    .with_field("workflow", workflow.as_str())
                    .with_field("run_id", run_id.as_str()),
            );
            info!(workflow = %workflow, run_id = %run_id, "Workflow completed");
            Ok(json!({
                "success": true,
                "workflow": workflow,
                "run_id": run_id,
                "issue_url": issue_url,
                "result": Value::Object(mapping),
            }))
        }
        Err(err) => {
            tracker.fail(&run_id, err.to_string());
            telemetry.emit(
                StructuredEvent::error("workflow_failed", COMPONENT)
                    .with_field("workflow", workflow.as_str())
                    .with_field("run_id", run_id.as_str())
                    .with_field("error_type", err.kind().as_str())
                    .with_field("error", err.to_string()),
            );
            warn!(workflow = %workflow, error = %err, "Workflow failed");
            Err(WorkflowError::new(format!("workflow '{workflow}' failed: {err}"))
                .with_workflow(workflow)
                .with_cause(err)
                .into())
        }
    }
}

impl WorkflowManager {
    /// Creates a manager using the composer's registry configuration for the
    /// input contract and batch concurrency.
    pub fn new(composer: StageComposer) -> FlowResult<Self> {
        let config = composer.registry().config();
        let contract = InputContract::from_settings(&config.contract)?;
        let max_concurrency = config.batch.max_concurrency.max(1);
        let telemetry = composer.registry().telemetry().clone();
        Ok(Self {
            composer,
            workflows: RwLock::new(BTreeMap::new()),
            contract,
            telemetry,
            max_concurrency,
        })
    }

    /// Replaces the input contract.
    #[must_use]
    pub fn with_contract(mut self, contract: InputContract) -> Self {
        self.contract = contract;
        self
    }

    /// The composer that builds this manager's workflows.
    #[must_use]
    pub fn composer(&self) -> &StageComposer {
        &self.composer
    }

    /// Builds and registers a workflow, replacing one with the same name.
    pub fn register_workflow(&self, name: &str, config: &WorkflowConfig) -> FlowResult<()> {
        let graph = self.composer.create_workflow(name, config)?;
        self.workflows.write().insert(name.to_string(), Arc::new(graph));
        info!(workflow = %name, "Registered workflow");
        Ok(())
    }

    /// Registered workflow names, sorted.
    #[must_use]
    pub fn list_workflows(&self) -> Vec<String> {
        self.workflows.read().keys().cloned().collect()
    }

    /// Returns a registered workflow.
    #[must_use]
    pub fn workflow(&self, name: &str) -> Option<Arc<ExecutionGraph>> {
        self.workflows.read().get(name).cloned()
    }

    fn require(&self, name: &str) -> FlowResult<Arc<ExecutionGraph>> {
        self.workflow(name).ok_or_else(|| {
            WorkflowError::new(format!("unknown workflow '{name}'"))
                .with_workflow(name)
                .into()
        })
    }

    /// Validates `input` and runs a named workflow.
    ///
    /// Returns `{success, workflow, issue_url, result}`. A contract
    /// violation fails with [`FlowError::Validation`] before any stage runs;
    /// an execution failure is wrapped in [`FlowError::Workflow`] with the
    /// stage error as its cause.
    pub async fn execute_workflow(&self, name: &str, input: &StateMap) -> FlowResult<Value> {
        self.execute_workflow_with(name, input, Arc::new(CancellationToken::new()))
            .await
    }

    /// Like [`Self::execute_workflow`], stopping between stages once `cancel`
    /// is triggered.
    pub async fn execute_workflow_with(
        &self,
        name: &str,
        input: &StateMap,
        cancel: Arc<CancellationToken>,
    ) -> FlowResult<Value> {
        let graph = self.require(name)?;
        let state = self.contract.initial_state(input)?;
        let id = run_id(state.issue_url());
        run_tracked(graph, self.telemetry.clone(), state, cancel, id).await
    }

    /// Runs a named workflow once per input under the concurrency limit.
    ///
    /// Every input is contract-checked first; if any fails, the whole batch
    /// is rejected with a [`BatchProcessingError`] naming the offending
    /// items and nothing runs. Execution failures are recorded per item.
    pub async fn execute_batch(&self, name: &str, inputs: &[StateMap]) -> FlowResult<BatchReport> {
        let graph = self.require(name)?;

        let mut states = Vec::with_capacity(inputs.len());
        let mut rejected = Vec::new();
        for (index, input) in inputs.iter().enumerate() {
            match self.contract.initial_state(input) {
                Ok(state) => states.push(state),
                Err(err) => {
                    let identifier = self
                        .contract
                        .identifier(input)
                        .map_or_else(|| format!("item_{index}"), str::to_string);
                    warn!(workflow = %name, item = %identifier, error = %err, "Batch item rejected");
                    rejected.push(identifier);
                }
            }
        }
        if !rejected.is_empty() {
            return Err(BatchProcessingError::new(
                format!("{} of {} batch inputs failed validation", rejected.len(), inputs.len()),
                rejected,
            )
            .into());
        }

        let total = states.len();
        self.telemetry.emit(
            StructuredEvent::info("batch_started", COMPONENT)
                .with_field("workflow", name)
                .with_field("total", total)
                .with_field("max_concurrency", self.max_concurrency),
        );

        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let handles: Vec<_> = states
            .into_iter()
            .enumerate()
            .map(|(index, state)| {
                let graph = graph.clone();
                let telemetry = self.telemetry.clone();
                let permits = permits.clone();
                let id = format!("{}_item_{index}", run_id(state.issue_url()));
                tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| FlowError::Internal(format!("batch limiter closed: {e}")))?;
                    run_tracked(graph, telemetry, state, Arc::new(CancellationToken::new()), id).await
                })
            })
            .collect();

        let identifiers: Vec<String> = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                self.contract
                    .identifier(input)
                    .map_or_else(|| format!("item_{index}"), str::to_string)
            })
            .collect();

        let mut results = Vec::with_capacity(total);
        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            let identifier = identifiers[index].clone();
            let outcome = joined
                .map_err(|e| FlowError::Internal(format!("batch item panicked: {e}")))
                .and_then(|r| r);
            let result = match outcome {
                Ok(output) => BatchItemResult {
                    index,
                    identifier,
                    output: Some(output),
                    error: None,
                },
                Err(err) => {
                    self.telemetry.emit(
                        StructuredEvent::warn("batch_item_failed", COMPONENT)
                            .with_field("workflow", name)
                            .with_field("index", index)
                            .with_field("identifier", identifier.as_str())
                            .with_field("error", err.to_string()),
                    );
                    BatchItemResult {
                        index,
                        identifier,
                        output: None,
                        error: Some(err.to_dict()),
                    }
                }
            };
            results.push(result);
        }

        let successful = results.iter().filter(|r| r.is_success()).count();
        let report = BatchReport {
            total,
            successful,
            failed: total - successful,
            results,
        };
        self.telemetry.emit(
            StructuredEvent::info("batch_completed", COMPONENT)
                .with_field("workflow", name)
                .with_field("total", report.total)
                .with_field("successful", report.successful)
                .with_field("failed", report.failed),
        );
        info!(
            workflow = %name,
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "Batch completed"
        );
        Ok(report)
    }
}
