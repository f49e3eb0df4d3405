use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use machinist_core::error::{MachinistError, Result};
use machinist_core::traits::Tool;
use machinist_core::types::ToolResult;
use machinist_memory::ManualIndex;

/// Looks up passages in the indexed machine manuals.
///
/// Output is a JSON body `{"matches": [{content, source, score}]}` so that
/// downstream synthesis can cite the `source` identifiers verbatim.
pub struct ManualLookupTool {
    index: Arc<ManualIndex>,
    k: usize,
}

impl ManualLookupTool {
    pub fn new(index: Arc<ManualIndex>, k: usize) -> Self {
        Self { index, k }
    }
}

impl Tool for ManualLookupTool {
    fn name(&self) -> &str {
        "manual_lookup"
    }

    fn description(&self) -> &str {
        "Look up machine manuals for operation, specifications, error codes, and \
         troubleshooting steps. Returns the most relevant manual passages with their \
         source documents."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look up in the manuals"
                }
            },
            "required": ["query"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let query = input["query"].as_str().ok_or_else(|| {
                MachinistError::ToolExecution {
                    tool: "manual_lookup".into(),
                    message: "'query' must be a string".into(),
                }
            })?;

            let matches =
                self.index
                    .search(query, self.k)
                    .map_err(|e| MachinistError::ToolExecution {
                        tool: "manual_lookup".into(),
                        message: e.to_string(),
                    })?;

            debug!(query, hits = matches.len(), "Manual lookup");

            let body = json!({ "matches": matches });
            Ok(ToolResult::success(serde_json::to_string_pretty(&body)?))
        })
    }
}
