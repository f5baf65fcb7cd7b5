//! The standard three-phase ticket pipeline.

use super::config::{ParallelGroup, WorkflowConfig};
use super::manager::WorkflowManager;
use crate::errors::FlowResult;
use crate::generation::COLLABORATIVE_GENERATOR;
use crate::stages::DEPENDENCY_SEARCH_TOOL;

/// Issue intake: fetch, clarify and plan.
pub const ISSUE_PROCESSING: &str = "issue_processing";
/// Context extraction and collaborative generation.
pub const CODE_GENERATION: &str = "code_generation";
/// Integration, test execution and review.
pub const INTEGRATION_TESTING: &str = "integration_testing";
/// Every phase end to end.
pub const FULL_WORKFLOW: &str = "full_workflow";

const ISSUE_STAGES: [&str; 3] = ["fetch_issue", "ticket_clarity", "implementation_planner"];
const GENERATION_STAGES: [&str; 2] = ["code_extractor", COLLABORATIVE_GENERATOR];
const INTEGRATION_STAGES: [&str; 3] = ["code_integrator", "test_runner", "code_reviewer"];

/// Workflow configs of the standard pipeline, by name.
///
/// `full_workflow` plans the ticket and analyzes dependencies concurrently.
/// The dependency search tool is requested only when `with_search_tool`.
#[must_use]
pub fn standard_workflows(with_search_tool: bool) -> Vec<(&'static str, WorkflowConfig)> {
    let tools: Vec<&str> = if with_search_tool {
        vec![DEPENDENCY_SEARCH_TOOL]
    } else {
        Vec::new()
    };

    let full = WorkflowConfig::new(
        ["fetch_issue", "ticket_clarity", "implementation_planner", "dependency_analyzer"]
            .into_iter()
            .chain(GENERATION_STAGES)
            .chain(INTEGRATION_STAGES),
    )
    .with_tools(tools.iter().copied())
    .with_parallel_group(ParallelGroup::new(
        "analysis",
        [vec!["ticket_clarity", "implementation_planner"], vec!["dependency_analyzer"]],
    ));

    vec![
        (ISSUE_PROCESSING, WorkflowConfig::new(ISSUE_STAGES)),
        (CODE_GENERATION, WorkflowConfig::new(GENERATION_STAGES)),
        (INTEGRATION_TESTING, WorkflowConfig::new(INTEGRATION_STAGES)),
        (FULL_WORKFLOW, full),
    ]
}

/// Registers the standard workflows with `manager`.
///
/// The stages must already be registered with the manager's composer.
/// Returns the installed names.
pub fn install_standard_workflows(manager: &WorkflowManager) -> FlowResult<Vec<String>> {
    let with_search_tool = manager.composer().tools().contains(DEPENDENCY_SEARCH_TOOL);
    let mut installed = Vec::new();
    for (name, config) in standard_workflows(with_search_tool) {
        manager.register_workflow(name, &config)?;
        installed.push(name.to_string());
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStep;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_full_workflow_shape() {
        let (_, full) = standard_workflows(false).pop().unwrap();
        let steps = full.steps().unwrap();
        assert_eq!(steps.len(), 7);
        assert_eq!(steps[0], WorkflowStep::Stage("fetch_issue".into()));
        let WorkflowStep::Parallel(group) = &steps[1] else {
            panic!("expected analysis group");
        };
        assert_eq!(group.branches.len(), 2);
        assert_eq!(steps[3], WorkflowStep::Stage(COLLABORATIVE_GENERATOR.into()));
        assert!(full.tool_names.is_empty());
    }

    #[test]
    fn test_search_tool_requested_when_available() {
        let (_, full) = standard_workflows(true).pop().unwrap();
        assert_eq!(full.tool_names, vec![DEPENDENCY_SEARCH_TOOL]);
    }
}
