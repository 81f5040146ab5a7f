use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{parse_args, FileTool, ToolContext, ToolError};
use crate::kg;

const DEFAULT_LIMIT: usize = 20;

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    include_deleted: bool,
}

/// Case-insensitive regex; queries that do not parse are matched literally.
fn compile_query(query: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(query)
        .case_insensitive(true)
        .build()
        .or_else(|_| RegexBuilder::new(&regex::escape(query)).case_insensitive(true).build())
}

pub struct SearchFilesTool;

impl FileTool for SearchFilesTool {
    fn name(&self) -> &'static str {
        "search_files"
    }

    fn description(&self) -> &'static str {
        "Search recorded files and directories whose path matches query (case-insensitive regex or plain text)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1, "default": DEFAULT_LIMIT},
                "include_deleted": {"type": "boolean", "default": false}
            },
            "required": ["query"]
        })
    }

    fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let args: SearchArgs = parse_args(args)?;
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).max(1);
        let pattern = compile_query(&args.query).map_err(|e| ToolError::Search(e.into()))?;
        let hits = kg::search_nodes(&ctx.db, None, &pattern, args.include_deleted, usize::MAX).map_err(ToolError::Search)?;

        // The graph may hold nodes for roots that were later removed from the allow-list.
        let visible: Vec<&Value> = hits
            .iter()
            .filter(|n| n.get("path").and_then(Value::as_str).map_or(false, |p| ctx.authorizer.is_allowed(std::path::Path::new(p))))
            .take(limit)
            .collect();
        debug!(query = %args.query, hits = visible.len(), "search_files");

        if visible.is_empty() {
            return Ok(format!("No files found matching '{}'", args.query));
        }
        let lines: Vec<String> = visible
            .iter()
            .map(|n| {
                let kind = n.get("type").and_then(Value::as_str).unwrap_or("File");
                let path = n.get("path").and_then(Value::as_str).unwrap_or_default();
                let mut line = format!("[{}] {}", kind, path);
                if let Some(size) = n.get("size").and_then(Value::as_u64) {
                    line.push_str(&format!(" ({} bytes)", size));
                }
                if n.get("deleted").and_then(Value::as_bool).unwrap_or(false) {
                    line.push_str(" (deleted)");
                }
                line
            })
            .collect();
        Ok(format!("Found {} match(es):\n{}", lines.len(), lines.join("\n")))
    }
}
