//! Stage and tool registries, and workflow construction.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::config::{WorkflowConfig, WorkflowStep};
use super::graph::{ExecutionGraph, GraphNode};
use crate::errors::{ContractErrorInfo, FlowResult, ValidationError};
use crate::recovery::ErrorRecoveryEngine;
use crate::registry::ServiceRegistry;
use crate::stages::{GuardedStage, Stage};
use crate::tools::{Tool, ToolRegistry, ToolSet};

/// Builds executable workflows from registered stages and tools.
///
/// Every stage is wrapped with the breaker named after it in the shared
/// registry, so two workflows using the same stage share its breaker.
#[derive(Debug)]
pub struct StageComposer {
    registry: ServiceRegistry,
    stages: RwLock<BTreeMap<String, Arc<dyn Stage>>>,
    tools: ToolRegistry,
    recovery: Option<Arc<ErrorRecoveryEngine>>,
}

impl StageComposer {
    /// Creates a composer over `registry` without failure recovery.
    #[must_use]
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            stages: RwLock::new(BTreeMap::new()),
            tools: ToolRegistry::new(),
            recovery: None,
        }
    }

    /// Routes stage failures of every built workflow through `engine`.
    #[must_use]
    pub fn with_recovery(mut self, engine: Arc<ErrorRecoveryEngine>) -> Self {
        self.recovery = Some(engine);
        self
    }

    /// The shared service registry.
    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// The recovery engine, if any.
    #[must_use]
    pub fn recovery(&self) -> Option<&Arc<ErrorRecoveryEngine>> {
        self.recovery.as_ref()
    }

    /// Registers or replaces a stage under its own name.
    pub fn register_stage(&self, stage: Arc<dyn Stage>) {
        let name = stage.name().to_string();
        debug!(stage = %name, "Registered stage");
        self.stages.write().insert(name, stage);
    }

    /// Registers or replaces a tool.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
    }

    /// The tool registry.
    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Registered stage names, sorted.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.read().keys().cloned().collect()
    }

    /// Returns true if a stage is registered under `name`.
    #[must_use]
    pub fn has_stage(&self, name: &str) -> bool {
        self.stages.read().contains_key(name)
    }

    /// Builds a workflow.
    ///
    /// Named tools are resolved and bound to tool-aware stages; every stage
    /// is then guarded by its breaker. Fails with a validation error when
    /// the config is malformed or names an unknown stage or tool.
    pub fn create_workflow(&self, name: &str, config: &WorkflowConfig) -> FlowResult<ExecutionGraph> {
        let steps = config.steps()?;
        let tools = self.tools.select(&config.tool_names)?;

        let mut nodes = Vec::with_capacity(steps.len());
        for step in steps {
            let node = match step {
                WorkflowStep::Stage(stage) => GraphNode::Stage(self.build_stage(name, &stage, &tools)?),
                WorkflowStep::Parallel(group) => GraphNode::Parallel {
                    branches: group
                        .branches
                        .iter()
                        .map(|branch| {
                            branch
                                .iter()
                                .map(|stage| self.build_stage(name, stage, &tools))
                                .collect::<FlowResult<Vec<_>>>()
                        })
                        .collect::<FlowResult<Vec<_>>>()?,
                    name: group.name,
                },
            };
            nodes.push(node);
        }

        let mut graph = ExecutionGraph::new(name, nodes, self.registry.telemetry().clone());
        if let Some(engine) = &self.recovery {
            graph = graph.with_recovery(engine.clone());
        }
        debug!(workflow = %name, stages = ?graph.stage_names(), "Created workflow");
        Ok(graph)
    }

    fn build_stage(&self, workflow: &str, name: &str, tools: &ToolSet) -> FlowResult<Arc<GuardedStage>> {
        let Some(stage) = self.stages.read().get(name).cloned() else {
            return Err(ValidationError::new(format!(
                "workflow '{workflow}' references unknown stage '{name}'"
            ))
            .with_field("stage_names")
            .with_error_info(
                ContractErrorInfo::new("CONTRACT-004-UNKNOWN_STAGE", "Workflow references an unregistered stage")
                    .with_fix_hint("Register the stage with the composer before creating the workflow.")
                    .with_context_entry("stage", name),
            )
            .into());
        };

        let stage = if tools.is_empty() {
            stage
        } else {
            stage.bind_tools(tools).unwrap_or(stage)
        };
        Ok(Arc::new(GuardedStage::new(
            stage,
            self.registry.breakers(),
            self.registry.telemetry().clone(),
        )))
    }
}
