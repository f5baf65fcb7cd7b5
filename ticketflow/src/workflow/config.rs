//! Declarative description of a workflow.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::{ContractErrorInfo, FlowResult, ValidationError};

/// Stages that run concurrently on copies of the same state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    /// Group name, used in events.
    pub name: String,
    /// Branches in declared order; each branch runs its stages in sequence.
    pub branches: Vec<Vec<String>>,
}

impl ParallelGroup {
    /// Creates a group from branch stage lists.
    #[must_use]
    pub fn new<I, B, S>(name: impl Into<String>, branches: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            branches: branches
                .into_iter()
                .map(|b| b.into_iter().map(Into::into).collect())
                .collect(),
        }
    }

    /// All member stage names.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().flatten().map(String::as_str)
    }
}

/// One scheduling step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStep {
    /// A single stage.
    Stage(String),
    /// A fork-join over a parallel group.
    Parallel(ParallelGroup),
}

/// Ordered stage names, tools to bind and optional parallel groups.
///
/// A parallel group takes the position of its first member in
/// `stage_names`; its other members are pulled into the group wherever they
/// are listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Stages in execution order.
    pub stage_names: Vec<String>,
    /// Tools bound to tool-aware stages before execution.
    pub tool_names: Vec<String>,
    /// Concurrent groups.
    pub parallel_groups: Vec<ParallelGroup>,
}

fn composition_error(message: String, code: &str, summary: &str, hint: &str) -> ValidationError {
    ValidationError::new(message)
        .with_field("stage_names")
        .with_error_info(ContractErrorInfo::new(code, summary).with_fix_hint(hint))
}

impl WorkflowConfig {
    /// A sequential workflow.
    #[must_use]
    pub fn new<I, S>(stage_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stage_names: stage_names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Adds tools to bind.
    #[must_use]
    pub fn with_tools<I, S>(mut self, tool_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_names.extend(tool_names.into_iter().map(Into::into));
        self
    }

    /// Adds a parallel group.
    #[must_use]
    pub fn with_parallel_group(mut self, group: ParallelGroup) -> Self {
        self.parallel_groups.push(group);
        self
    }

    /// Resolves the scheduling steps.
    ///
    /// Fails when the workflow is empty, lists a stage twice, or has a
    /// group with fewer than two branches, an empty branch, a member missing
    /// from `stage_names` or a member shared with another group.
    pub fn steps(&self) -> FlowResult<Vec<WorkflowStep>> {
        if self.stage_names.is_empty() {
            return Err(composition_error(
                "workflow has no stages".to_string(),
                "CONTRACT-004-EMPTY",
                "Cannot build an empty workflow",
                "List at least one stage in stage_names.",
            )
            .into());
        }

        let mut listed = HashSet::new();
        for name in &self.stage_names {
            if !listed.insert(name.as_str()) {
                return Err(composition_error(
                    format!("stage '{name}' is listed twice"),
                    "CONTRACT-004-DUPLICATE",
                    "A stage may appear only once per workflow",
                    "Register a second stage under another name.",
                )
                .into());
            }
        }

        let mut grouped = HashSet::new();
        for group in &self.parallel_groups {
            if group.branches.len() < 2 || group.branches.iter().any(Vec::is_empty) {
                return Err(composition_error(
                    format!("parallel group '{}' needs at least two non-empty branches", group.name),
                    "CONTRACT-004-PARALLEL",
                    "Malformed parallel group",
                    "Give each parallel group two or more branches with at least one stage each.",
                )
                .into());
            }
            for member in group.members() {
                if !listed.contains(member) || !grouped.insert(member) {
                    return Err(composition_error(
                        format!("parallel group '{}' member '{member}' is unlisted or shared", group.name),
                        "CONTRACT-004-PARALLEL",
                        "Parallel members must be listed stages owned by one group",
                        "Add the member to stage_names and keep it in a single group.",
                    )
                    .into());
                }
            }
        }

        let mut placed = HashSet::new();
        let mut steps = Vec::new();
        for name in &self.stage_names {
            match self
                .parallel_groups
                .iter()
                .find(|g| g.members().any(|m| m == name))
            {
                Some(group) => {
                    if placed.insert(group.name.as_str()) {
                        steps.push(WorkflowStep::Parallel(group.clone()));
                    }
                }
                None => steps.push(WorkflowStep::Stage(name.clone())),
            }
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FlowError;
    use pretty_assertions::assert_eq;

    fn code(err: &FlowError) -> String {
        match err {
            FlowError::Validation(v) => v.error_info.as_ref().map(|i| i.code.clone()).unwrap_or_default(),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_sequential_steps() {
        let steps = WorkflowConfig::new(["a", "b"]).steps().unwrap();
        assert_eq!(
            steps,
            vec![WorkflowStep::Stage("a".into()), WorkflowStep::Stage("b".into())]
        );
    }

    #[test]
    fn test_group_sits_at_first_member() {
        let group = ParallelGroup::new("analysis", [vec!["b", "c"], vec!["d"]]);
        let config = WorkflowConfig::new(["a", "b", "c", "d", "e"]).with_parallel_group(group.clone());
        assert_eq!(
            config.steps().unwrap(),
            vec![
                WorkflowStep::Stage("a".into()),
                WorkflowStep::Parallel(group),
                WorkflowStep::Stage("e".into()),
            ]
        );
    }

    #[test]
    fn test_invalid_configs() {
        assert_eq!(code(&WorkflowConfig::default().steps().unwrap_err()), "CONTRACT-004-EMPTY");
        assert_eq!(
            code(&WorkflowConfig::new(["a", "a"]).steps().unwrap_err()),
            "CONTRACT-004-DUPLICATE"
        );
        let single = WorkflowConfig::new(["a"])
            .with_parallel_group(ParallelGroup::new("g", [vec!["a"]]));
        assert_eq!(code(&single.steps().unwrap_err()), "CONTRACT-004-PARALLEL");
        let unlisted = WorkflowConfig::new(["a"])
            .with_parallel_group(ParallelGroup::new("g", [vec!["a"], vec!["z"]]));
        assert_eq!(code(&unlisted.steps().unwrap_err()), "CONTRACT-004-PARALLEL");
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: WorkflowConfig =
            serde_json::from_str(r#"{"stage_names": ["fetch_issue"]}"#).unwrap();
        assert_eq!(config, WorkflowConfig::new(["fetch_issue"]));
    }
}
