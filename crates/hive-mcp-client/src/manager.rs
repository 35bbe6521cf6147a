// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use hive_config::ToolServerSpec;
use hive_tools::{ExternalDispatch, ToolSchema};

use crate::connection::ToolServerConnection;

/// Default per-call timeout for external tool invocations.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Tool name exposed to the model for `tool` on `server`.
pub fn exposed_name(server: &str, tool: &str) -> String {
    format!("ext_{server}_{tool}")
}

/// Owns every external tool server connection for the running graph.
///
/// A server that fails to connect is recorded and skipped; the rest of the
/// graph load continues.
#[derive(Default)]
pub struct ExternalToolManager {
    connections: RwLock<HashMap<String, Arc<ToolServerConnection>>>,
    failures: RwLock<HashMap<String, String>>,
}

impl ExternalToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every declared server.  Failures do not abort: they land in
    /// the failure record for the UI / logs.
    pub async fn connect_all(&self, servers: &BTreeMap<String, ToolServerSpec>) {
        for (name, spec) in servers {
            match ToolServerConnection::connect(name, spec).await {
                Ok(conn) => {
                    info!(server = %name, tools = conn.tools().len(), "external tool server connected");
                    self.connections
                        .write()
                        .expect("manager poisoned")
                        .insert(name.clone(), Arc::new(conn));
                }
                Err(e) => {
                    warn!(server = %name, "external tool server failed to connect: {e:#}");
                    self.failures
                        .write()
                        .expect("manager poisoned")
                        .insert(name.clone(), format!("{e:#}"));
                }
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<Arc<ToolServerConnection>> = self
            .connections
            .write()
            .expect("manager poisoned")
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in connections {
            conn.disconnect().await;
        }
        self.failures.write().expect("manager poisoned").clear();
    }

    /// Connection failures recorded during the last `connect_all`.
    pub fn failures(&self) -> HashMap<String, String> {
        self.failures.read().expect("manager poisoned").clone()
    }

    pub fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .read()
            .expect("manager poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn connection(&self, server: &str) -> Option<Arc<ToolServerConnection>> {
        self.connections
            .read()
            .expect("manager poisoned")
            .get(server)
            .cloned()
    }
}

#[async_trait]
impl ExternalDispatch for ExternalToolManager {
    async fn call(&self, server: &str, tool: &str, args: &Value) -> String {
        match self.connection(server) {
            Some(conn) => conn.call_tool(tool, args, CALL_TIMEOUT).await,
            None => format!("unknown external tool server: {server}"),
        }
    }

    fn schemas(&self) -> Vec<ToolSchema> {
        let connections = self.connections.read().expect("manager poisoned");
        let mut schemas = Vec::new();
        for (server, conn) in connections.iter() {
            for tool in conn.tools() {
                schemas.push(ToolSchema {
                    name: exposed_name(server, &tool.name),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                });
            }
        }
        schemas
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposed_name_uses_the_ext_prefix_convention() {
        assert_eq!(exposed_name("files", "read_file"), "ext_files_read_file");
    }

    #[tokio::test]
    async fn unknown_server_degrades_to_a_result_string() {
        let mgr = ExternalToolManager::new();
        let out = mgr.call("ghost", "tool", &serde_json::json!({})).await;
        assert_eq!(out, "unknown external tool server: ghost");
    }

    #[tokio::test]
    async fn failed_server_is_recorded_but_does_not_abort() {
        let mut servers = BTreeMap::new();
        servers.insert(
            "broken".to_string(),
            ToolServerSpec {
                command: "/nonexistent/binary".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
        );
        let mgr = ExternalToolManager::new();
        mgr.connect_all(&servers).await;
        assert!(mgr.connected_servers().is_empty());
        assert!(mgr.failures().contains_key("broken"));
    }
}
