//! Fixed table of file tools, dispatched by name.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use super::fs_ops::{
    CopyFileTool, CreateDirectoryTool, CreateFileTool, DeleteFileTool, MoveFileTool, RenameFileTool, ZipFilesTool,
};
use super::search::SearchFilesTool;
use super::{FileTool, ToolContext, ToolDefinition, ToolError};

pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Box<dyn FileTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut registry = Self { tools: BTreeMap::new() };
        registry.register(Box::new(RenameFileTool));
        registry.register(Box::new(MoveFileTool));
        registry.register(Box::new(CopyFileTool));
        registry.register(Box::new(DeleteFileTool));
        registry.register(Box::new(CreateFileTool));
        registry.register(Box::new(CreateDirectoryTool));
        registry.register(Box::new(ZipFilesTool));
        registry.register(Box::new(SearchFilesTool));
        debug!(count = registry.tools.len(), "registered file tools");
        registry
    }

    fn register(&mut self, tool: Box<dyn FileTool>) {
        self.tools.insert(tool.name(), tool);
    }

    /// Definitions in name order.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn call(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let result = tool.execute(args, ctx);
        if let Err(err) = &result {
            warn!(tool = name, error = %err, "tool call failed");
        }
        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
