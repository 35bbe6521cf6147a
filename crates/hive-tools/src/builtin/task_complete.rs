// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolContext};

/// Lets the model mark its current task as finished.  An ordinary tool: the
/// return string is recorded as a tool result and the loop continues normally.
pub struct TaskCompleteTool;

#[async_trait]
impl Tool for TaskCompleteTool {
    fn name(&self) -> &str {
        "task_complete"
    }

    fn description(&self) -> &str {
        "Signal that the current task is complete. \
         Provide a short summary of what was accomplished."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "One or two sentences on the outcome."
                }
            },
            "required": [],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let summary = args.get("summary").and_then(|v| v.as_str()).unwrap_or("");
        if summary.is_empty() {
            Ok("task marked complete".into())
        } else {
            Ok(format!("task marked complete: {summary}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn records_the_summary() {
        let t = TaskCompleteTool;
        let ctx = ToolContext {
            agent_id: "a".into(),
        };
        let out = t
            .execute(&json!({"summary": "all files sorted"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "task marked complete: all files sorted");
        let out = t.execute(&json!({}), &ctx).await.unwrap();
        assert_eq!(out, "task marked complete");
    }
}
