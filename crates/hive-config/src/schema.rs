// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The complete declarative agent graph.
///
/// This is the atomic unit of reload: the controller replaces the entire
/// running system with the contents of one `GraphSpec`.  It mirrors the
/// persisted `system.json` document byte-for-byte (unknown editor fields such
/// as node positions are carried through untouched).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Map server name → launch spec for out-of-process tool servers.
    #[serde(default)]
    pub external_tool_servers: BTreeMap<String, ToolServerSpec>,
}

impl GraphSpec {
    /// Validate the graph shape.  Returns one message per problem found.
    ///
    /// A non-empty result does not prevent loading: the controller skips the
    /// offending entries and loads the rest of the graph.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                problems.push(format!("agent {:?} has an empty id", agent.name));
            } else if !seen.insert(agent.id.as_str()) {
                problems.push(format!("duplicate agent id: {}", agent.id));
            }
        }
        for conn in &self.connections {
            if !self.agents.iter().any(|a| a.id == conn.source) {
                problems.push(format!(
                    "connection {} references unknown source agent: {}",
                    conn.id, conn.source
                ));
            }
            if !self.agents.iter().any(|a| a.id == conn.target) {
                problems.push(format!(
                    "connection {} references unknown target agent: {}",
                    conn.id, conn.target
                ));
            }
        }
        problems
    }

    /// Directed edge set `(source, target)` for the message bus.
    pub fn edges(&self) -> std::collections::HashSet<(String, String)> {
        self.connections
            .iter()
            .map(|c| (c.source.clone(), c.target.clone()))
            .collect()
    }
}

/// One agent node in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Stable identifier; referenced by connections and the bus.
    pub id: String,
    /// Display name shown in the UI and in internal-message headers.
    pub name: String,
    /// Editor canvas position, carried through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<serde_json::Value>,
    #[serde(default)]
    pub data: AgentData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentData {
    #[serde(default)]
    pub system_prompt: String,
    /// Per-agent provider override; falls back to the runtime default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Cap on tool-using iterations per turn.  Clamped to a floor of 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron_jobs: Vec<CronJob>,
}

/// A cron-triggered self-activation: at each tick of `expression` the agent
/// receives `prompt` as if a user had sent it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub expression: String,
    pub prompt: String,
}

/// A directed permission edge: `source` may message `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Advisory routing hint from the graph editor.  Parsed and persisted
    /// verbatim; the live routing path is the explicit send_message tool and
    /// does not evaluate this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Launch spec for an external tool server child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Merged over the parent environment when spawning.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Which wire dialect a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openai,
    Mock,
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::Openai),
            "mock" => Ok(Self::Mock),
            other => anyhow::bail!("unknown provider kind: {other:?} (anthropic | openai | mock)"),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::Openai => write!(f, "openai"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Fully resolved provider settings for one agent: the agent's overrides
/// applied on top of the runtime defaults.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentSpec {
        AgentSpec {
            id: id.into(),
            name: id.to_uppercase(),
            position: None,
            data: AgentData::default(),
        }
    }

    #[test]
    fn empty_graph_is_default() {
        let g = GraphSpec::default();
        assert!(g.agents.is_empty());
        assert!(g.connections.is_empty());
        assert!(g.external_tool_servers.is_empty());
    }

    #[test]
    fn validate_accepts_well_formed_graph() {
        let g = GraphSpec {
            agents: vec![agent("a"), agent("b")],
            connections: vec![Connection {
                id: "e1".into(),
                source: "a".into(),
                target: "b".into(),
                data: None,
            }],
            external_tool_servers: BTreeMap::new(),
        };
        assert!(g.validate().is_empty());
    }

    #[test]
    fn validate_flags_duplicate_agent_ids() {
        let g = GraphSpec {
            agents: vec![agent("a"), agent("a")],
            ..GraphSpec::default()
        };
        let problems = g.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("duplicate"));
    }

    #[test]
    fn validate_flags_empty_agent_id() {
        let g = GraphSpec {
            agents: vec![agent("")],
            ..GraphSpec::default()
        };
        assert!(g.validate()[0].contains("empty id"));
    }

    #[test]
    fn validate_flags_dangling_connection() {
        let g = GraphSpec {
            agents: vec![agent("a")],
            connections: vec![Connection {
                id: "e1".into(),
                source: "a".into(),
                target: "ghost".into(),
                data: None,
            }],
            ..GraphSpec::default()
        };
        let problems = g.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("ghost"));
    }

    #[test]
    fn edges_returns_directed_pairs() {
        let g = GraphSpec {
            agents: vec![agent("a"), agent("b")],
            connections: vec![Connection {
                id: "e1".into(),
                source: "a".into(),
                target: "b".into(),
                data: None,
            }],
            ..GraphSpec::default()
        };
        let edges = g.edges();
        assert!(edges.contains(&("a".to_string(), "b".to_string())));
        assert!(!edges.contains(&("b".to_string(), "a".to_string())));
    }

    // ── system.json round-trip ────────────────────────────────────────────────

    #[test]
    fn graph_deserialises_from_editor_json() {
        let json = r#"{
            "agents": [{
                "id": "researcher",
                "name": "Researcher",
                "position": {"x": 120, "y": 40},
                "data": {
                    "system_prompt": "You research things.",
                    "provider": "anthropic",
                    "model": "claude-sonnet-4-5",
                    "max_iterations": 20,
                    "cron_jobs": [{"expression": "0 0 9 * * *", "prompt": "morning check"}]
                }
            }],
            "connections": [{"id": "c1", "source": "researcher", "target": "researcher"}],
            "external_tool_servers": {
                "files": {"command": "file-server", "args": ["--stdio"], "env": {"DEBUG": "1"}}
            }
        }"#;
        let g: GraphSpec = serde_json::from_str(json).unwrap();
        assert_eq!(g.agents.len(), 1);
        assert_eq!(g.agents[0].data.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(g.agents[0].data.cron_jobs.len(), 1);
        assert_eq!(g.external_tool_servers["files"].command, "file-server");
    }

    #[test]
    fn graph_json_round_trip_preserves_position_and_condition() {
        let json = r#"{
            "agents": [{"id": "a", "name": "A", "position": {"x": 1}, "data": {"system_prompt": "p"}}],
            "connections": [{"id": "c", "source": "a", "target": "a", "data": {"condition": "always"}}],
            "external_tool_servers": {}
        }"#;
        let g: GraphSpec = serde_json::from_str(json).unwrap();
        let back = serde_json::to_value(&g).unwrap();
        assert_eq!(back["agents"][0]["position"]["x"], 1);
        assert_eq!(back["connections"][0]["data"]["condition"], "always");
    }

    #[test]
    fn missing_optional_sections_default_to_empty() {
        let g: GraphSpec = serde_json::from_str(r#"{"agents": []}"#).unwrap();
        assert!(g.connections.is_empty());
        assert!(g.external_tool_servers.is_empty());
    }

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!("Anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!("OPENAI".parse::<ProviderKind>().unwrap(), ProviderKind::Openai);
        assert!("gemini".parse::<ProviderKind>().is_err());
    }
}
