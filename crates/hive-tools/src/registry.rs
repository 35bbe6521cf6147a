// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::tool::{Tool, ToolContext};

/// A tool schema as exposed to the model.  Mirrors the model crate's type but
/// keeps this crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Routing seam for tools proxied to out-of-process servers.  Implemented by
/// the external-transport manager; the registry only knows the name-mangling
/// convention.
#[async_trait]
pub trait ExternalDispatch: Send + Sync {
    /// Invoke `tool` on `server`.  Failures come back as result strings.
    async fn call(&self, server: &str, tool: &str, args: &Value) -> String;
    /// Discovered tools under their `ext_<server>_<tool>` names.
    fn schemas(&self) -> Vec<ToolSchema>;
}

/// Process-wide tool catalog and dispatcher.
///
/// The dynamic map is mutated by a single writer (registration during load or
/// plugin hot-reload); dispatch takes a snapshot under the read lock.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    external: RwLock<Option<Arc<dyn ExternalDispatch>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            external: RwLock::new(None),
        }
    }

    /// Register a tool.  Idempotent by name: re-registering replaces the
    /// handler, which is what plugin hot-reload relies on.
    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        debug!(tool = %tool.name(), "registering tool");
        self.tools
            .write()
            .expect("tool registry poisoned")
            .insert(tool.name().to_string(), tool);
    }

    /// Install the router for `ext_`-prefixed names.
    pub fn set_external_router(&self, router: Arc<dyn ExternalDispatch>) {
        *self.external.write().expect("tool registry poisoned") = Some(router);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .get(name)
            .cloned()
    }

    /// Ordered catalog of every callable tool, external tools included.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .read()
            .expect("tool registry poisoned")
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        if let Some(router) = self.external.read().expect("tool registry poisoned").as_ref() {
            schemas.extend(router.schemas());
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Dispatch a call by name.  Never fails: every failure mode degrades to
    /// a result string the model can read.
    ///
    /// Resolution order: the dynamic map, then the `ext_<server>_<tool>`
    /// prefix route, then an unknown-tool notice.
    pub async fn dispatch(&self, name: &str, args: &Value, ctx: &ToolContext) -> String {
        let handler = self.get(name);
        if let Some(tool) = handler {
            return match tool.execute(args, ctx).await {
                Ok(result) => result,
                Err(e) => format!("tool execution failed: {e}"),
            };
        }

        if let Some(rest) = name.strip_prefix("ext_") {
            // `ext_<server>_<tool>`: the server is the first segment, the
            // tool name is the remainder (it may itself contain separators).
            if let Some((server, tool)) = rest.split_once('_') {
                let router = self
                    .external
                    .read()
                    .expect("tool registry poisoned")
                    .clone();
                if let Some(router) = router {
                    return router.call(server, tool, args).await;
                }
            }
        }

        format!("unknown tool: {name}")
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    struct EchoTool {
        name: &'static str,
        reply: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            Ok(self.reply.to_string())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            anyhow::bail!("disk on fire")
        }
    }

    struct FakeRouter;

    #[async_trait]
    impl ExternalDispatch for FakeRouter {
        async fn call(&self, server: &str, tool: &str, _args: &Value) -> String {
            format!("routed {server}/{tool}")
        }
        fn schemas(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: "ext_files_read_file".into(),
                description: "external".into(),
                parameters: json!({ "type": "object" }),
            }]
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            agent_id: "a".into(),
        }
    }

    #[tokio::test]
    async fn dispatch_prefers_the_dynamic_map() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool {
            name: "greet",
            reply: "hello",
        });
        assert_eq!(reg.dispatch("greet", &json!({}), &ctx()).await, "hello");
    }

    #[tokio::test]
    async fn re_registering_replaces_the_handler() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool {
            name: "greet",
            reply: "v1",
        });
        reg.register(EchoTool {
            name: "greet",
            reply: "v2",
        });
        assert_eq!(reg.dispatch("greet", &json!({}), &ctx()).await, "v2");
        assert_eq!(reg.schemas().iter().filter(|s| s.name == "greet").count(), 1);
    }

    #[tokio::test]
    async fn tool_errors_become_result_strings() {
        let reg = ToolRegistry::new();
        reg.register(FailingTool);
        let out = reg.dispatch("broken", &json!({}), &ctx()).await;
        assert_eq!(out, "tool execution failed: disk on fire");
    }

    #[tokio::test]
    async fn ext_prefix_routes_to_the_external_dispatcher() {
        let reg = ToolRegistry::new();
        reg.set_external_router(Arc::new(FakeRouter));
        let out = reg.dispatch("ext_files_read_file", &json!({}), &ctx()).await;
        assert_eq!(out, "routed files/read_file");
    }

    #[tokio::test]
    async fn ext_tool_name_keeps_its_own_underscores() {
        let reg = ToolRegistry::new();
        reg.set_external_router(Arc::new(FakeRouter));
        let out = reg
            .dispatch("ext_srv_deeply_nested_tool", &json!({}), &ctx())
            .await;
        assert_eq!(out, "routed srv/deeply_nested_tool");
    }

    #[tokio::test]
    async fn registered_name_shadows_the_ext_route() {
        // The dynamic map wins even for an ext_-shaped name.
        let reg = ToolRegistry::new();
        reg.set_external_router(Arc::new(FakeRouter));
        reg.register(EchoTool {
            name: "ext_files_read_file",
            reply: "local override",
        });
        let out = reg.dispatch("ext_files_read_file", &json!({}), &ctx()).await;
        assert_eq!(out, "local override");
    }

    #[tokio::test]
    async fn unknown_tool_degrades_to_a_notice() {
        let reg = ToolRegistry::new();
        assert_eq!(
            reg.dispatch("nonexistent", &json!({}), &ctx()).await,
            "unknown tool: nonexistent"
        );
    }

    #[tokio::test]
    async fn ext_name_without_router_is_unknown() {
        let reg = ToolRegistry::new();
        let out = reg.dispatch("ext_files_read", &json!({}), &ctx()).await;
        assert_eq!(out, "unknown tool: ext_files_read");
    }

    #[test]
    fn schemas_are_sorted_and_include_external_tools() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool {
            name: "zeta",
            reply: "",
        });
        reg.register(EchoTool {
            name: "alpha",
            reply: "",
        });
        reg.set_external_router(Arc::new(FakeRouter));
        let names: Vec<String> = reg.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "ext_files_read_file", "zeta"]);
    }
}
