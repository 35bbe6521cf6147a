// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolContext};

/// Lets the model request input from the user.  The question travels to the
/// UI through the normal event stream; the tool result just acknowledges it.
pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question when you need information or a decision \
         you cannot obtain otherwise. The answer arrives as the next user message."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to put to the user."
                }
            },
            "required": ["question"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        match args.get("question").and_then(|v| v.as_str()) {
            Some(q) if !q.is_empty() => Ok(format!("question forwarded to the user: {q}")),
            _ => Ok("ask_user requires a non-empty 'question' argument".into()),
        }
    }
}
