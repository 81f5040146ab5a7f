//! File operation tools exposed to the agent and to direct callers.
//!
//! Each tool checks every path argument against the authorizer before it
//! touches the filesystem. Results are plain strings: the success message, or
//! `Error: ...` rendered from a [`ToolError`].

mod fs_ops;
mod registry;
mod search;

pub use registry::ToolRegistry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::authorizer::PathAuthorizer;

#[derive(Debug, Error)]
pub enum ToolError {
    /// Carries "Path" or "Paths" so single and multi-path tools read naturally.
    #[error("{0} not allowed")]
    NotAllowed(&'static str),
    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("search failed: {0}")]
    Search(#[source] anyhow::Error),
}

/// Shared handles a tool may need.
#[derive(Clone)]
pub struct ToolContext {
    pub authorizer: Arc<PathAuthorizer>,
    pub db: sled::Db,
}

impl ToolContext {
    /// Check every path up front; nothing is touched unless all pass.
    ///
    /// The paths come back as given so that operations on a symlink act on
    /// the link itself.
    pub(crate) fn authorize(&self, paths: &[&str]) -> Result<Vec<PathBuf>, ToolError> {
        let label = if paths.len() > 1 { "Paths" } else { "Path" };
        paths
            .iter()
            .map(|p| {
                let path = PathBuf::from(p);
                self.authorizer.check(&path).map(|_| path).map_err(|_| ToolError::NotAllowed(label))
            })
            .collect()
    }

    /// Check a path the tool derived from already authorized arguments.
    pub(crate) fn authorize_derived(&self, path: &Path) -> Result<(), ToolError> {
        self.authorizer.check(path).map(|_| ()).map_err(|_| ToolError::NotAllowed("Paths"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub trait FileTool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema for the arguments object.
    fn input_schema(&self) -> Value;

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

pub(crate) fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { Value::Object(Default::default()) } else { args };
    Ok(serde_json::from_value(args)?)
}

/// Flatten a tool result into the string handed back to the caller.
pub fn render(result: Result<String, ToolError>) -> String {
    match result {
        Ok(message) => message,
        Err(err) => format!("Error: {}", err),
    }
}
