//! Tool registry and bound tool sets.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::errors::{ContractErrorInfo, FlowResult, ValidationError};

/// Trait for tool implementations.
#[async_trait]
pub trait Tool: Send + Sync + fmt::Debug {
    /// Returns the tool's name.
    fn name(&self) -> &str;

    /// Returns a one-line description.
    fn description(&self) -> &str {
        ""
    }

    /// Invokes the tool with a JSON payload.
    async fn invoke(&self, input: Value) -> FlowResult<Value>;
}

/// A tool backed by a synchronous closure.
pub struct FnTool<F>
where
    F: Fn(Value) -> FlowResult<Value> + Send + Sync,
{
    name: String,
    description: String,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value) -> FlowResult<Value> + Send + Sync,
{
    /// Creates a closure tool.
    pub fn new(name: impl Into<String>, description: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            func,
        }
    }
}

impl<F> fmt::Debug for FnTool<F>
where
    F: Fn(Value) -> FlowResult<Value> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(Value) -> FlowResult<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, input: Value) -> FlowResult<Value> {
        (self.func)(input)
    }
}

/// The tools resolved for one workflow.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolSet {
    /// Returns a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Number of tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true when no tool is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

/// Registry for tool instances.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a tool under its own name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().insert(name, tool);
    }

    /// Returns a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    /// Checks if a tool is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Lists registered tool names, sorted.
    #[must_use]
    pub fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves the named tools into a set.
    ///
    /// Fails with a validation error naming every unknown tool.
    pub fn select(&self, names: &[String]) -> FlowResult<ToolSet> {
        let tools = self.tools.read();
        let missing: Vec<&str> = names
            .iter()
            .filter(|n| !tools.contains_key(n.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            let listed = missing.join(", ");
            return Err(ValidationError::new(format!("Unknown tools: {listed}"))
                .with_field("tool_names")
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-003-UNKNOWN_TOOL", "Workflow references unregistered tools")
                        .with_fix_hint("Register the tools with the composer before creating the workflow")
                        .with_context_entry("missing", listed),
                )
                .into());
        }
        Ok(ToolSet {
            tools: names
                .iter()
                .filter_map(|n| tools.get(n).map(|t| (n.clone(), t.clone())))
                .collect(),
        })
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list_tools())
            .finish()
    }
}
