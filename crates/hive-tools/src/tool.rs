// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

/// Where a tool came from.  External tools carry their server name so the
/// catalog can show provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOrigin {
    Builtin,
    Plugin,
    External(String),
}

/// Call-site context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Id of the agent whose turn is executing the call.
    pub agent_id: String,
}

/// Trait that every built-in and dynamically registered tool implements.
///
/// `execute` errors are converted by the dispatcher into a stringified
/// tool-result; a tool can never abort the conversation loop.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the argument object.
    fn parameters_schema(&self) -> Value;
    fn origin(&self) -> ToolOrigin {
        ToolOrigin::Builtin
    }
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String>;
}
