// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Inter-agent message bus: explicit directed-edge addressing with permission
//! checks and asynchronous, non-reentrant delivery.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use hive_tools::{Tool, ToolContext};

use crate::controller::SystemController;
use crate::worker::TalkOutcome;

/// Delivery defers by this long so the sender's turn finalises (and its
/// `message_end` is emitted) before the recipient starts.
const DELIVERY_DELAY: Duration = Duration::from_millis(100);

/// Roster descriptions are cut at this length.
const ROSTER_DESC_LIMIT: usize = 100;

pub struct MessageBus {
    controller: Weak<SystemController>,
}

impl MessageBus {
    pub fn new(controller: Weak<SystemController>) -> Self {
        Self { controller }
    }

    /// Route a message from `source_id` to `target_id`.
    ///
    /// Returns the string handed back to the sending model as its tool
    /// result.  Delivery itself happens on a fresh task after a short delay;
    /// a recipient that is still busy by then drops the message silently
    /// (the sender has already been told the send succeeded).
    pub async fn send(
        &self,
        source_id: &str,
        target_id: &str,
        message: &str,
        context: &Value,
    ) -> String {
        let Some(controller) = self.controller.upgrade() else {
            return "system is shutting down".into();
        };
        let Some(source) = controller.worker(source_id).await else {
            return format!("agent not found: {source_id}");
        };
        let Some(target) = controller.worker(target_id).await else {
            return format!("agent not found: {target_id}");
        };
        if !controller.edge_allowed(source_id, target_id).await {
            return format!("no permission: agent {source_id} cannot message {target_id}");
        }

        let payload = format!(
            "[internal message from {}]\n{message}\n(context: {context})",
            source.name()
        );
        let target_id = target_id.to_string();
        let target_for_task = target.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DELIVERY_DELAY).await;
            if target_for_task.is_busy() {
                debug!(target = %target_id, "recipient busy; dropping bus message");
                return;
            }
            if target_for_task.talk(&payload).await == TalkOutcome::Busy {
                debug!(target = %target_id, "recipient became busy; dropping bus message");
            }
        });

        format!("message sent to {target_id}", target_id = target.id())
    }

    /// Listing of agents visible to `requesting`: only peers reachable over
    /// an outgoing edge.  A `None` requester sees the full list.
    pub async fn roster(&self, requesting: Option<&str>) -> String {
        let Some(controller) = self.controller.upgrade() else {
            return String::new();
        };
        let workers = controller.workers_snapshot().await;
        let mut lines = Vec::new();
        for worker in workers {
            if let Some(source) = requesting {
                if !controller.edge_allowed(source, worker.id()).await {
                    continue;
                }
            }
            lines.push(format!(
                "- {} ({}): {}",
                worker.id(),
                worker.name(),
                truncate(worker.description(), ROSTER_DESC_LIMIT)
            ));
        }
        if lines.is_empty() {
            "no agents reachable".into()
        } else {
            lines.join("\n")
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ─── Bus-backed tools ─────────────────────────────────────────────────────────

/// `send_message` — lets an agent message a peer along a declared edge.
pub struct SendMessageTool {
    pub bus: Arc<MessageBus>,
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to another agent. Delivery is only permitted along \
         declared connections; use list_agents to see who you can reach."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target": {
                    "type": "string",
                    "description": "Id of the agent to message."
                },
                "message": {
                    "type": "string",
                    "description": "The message text."
                },
                "context": {
                    "type": "object",
                    "description": "Optional structured context forwarded verbatim."
                }
            },
            "required": ["target", "message"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let Some(target) = args.get("target").and_then(|v| v.as_str()) else {
            return Ok("send_message requires a 'target' agent id".into());
        };
        let Some(message) = args.get("message").and_then(|v| v.as_str()) else {
            return Ok("send_message requires a 'message' string".into());
        };
        let context = args.get("context").cloned().unwrap_or_else(|| json!({}));
        Ok(self.bus.send(&ctx.agent_id, target, message, &context).await)
    }
}

/// `list_agents` — the roster visible to the calling agent.
pub struct ListAgentsTool {
    pub bus: Arc<MessageBus>,
}

#[async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        "list_agents"
    }

    fn description(&self) -> &str {
        "List the agents you can reach with send_message."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn execute(&self, _args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        Ok(self.bus.roster(Some(&ctx.agent_id)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld, this is a long description";
        let out = truncate(s, 10);
        assert!(out.ends_with('…'));
        assert!(out.len() <= 14);
        assert_eq!(truncate("short", 10), "short");
    }
}
