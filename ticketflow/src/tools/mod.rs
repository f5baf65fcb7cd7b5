//! Tools that can be bound to tool-aware stages.
//!
//! A workflow config names the tools it needs; the composer resolves them
//! from the [`ToolRegistry`] into a [`ToolSet`] and offers that set to every
//! stage before execution begins.

mod registry;

pub use registry::{FnTool, Tool, ToolRegistry, ToolSet};
