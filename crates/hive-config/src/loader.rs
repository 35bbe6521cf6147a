// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::schema::{AgentData, GraphSpec, ProviderKind, ProviderSettings};

/// Process-level configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default provider dialect for agents without an override.
    pub provider: ProviderKind,
    /// Default model id.
    pub model: String,
    /// Default base URL override.
    pub base_url: Option<String>,
    /// Default credential.
    pub api_key: Option<String>,
    /// Root directory for the persisted graph, journals, and memory files.
    pub workspace: PathBuf,
    /// HTTP/WebSocket listen port.
    pub port: u16,
}

impl RuntimeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let provider: ProviderKind = std::env::var("HIVE_PROVIDER")
            .unwrap_or_else(|_| "anthropic".into())
            .parse()?;
        let model = std::env::var("HIVE_MODEL").unwrap_or_else(|_| default_model(provider).into());
        let base_url = std::env::var("HIVE_BASE_URL").ok();
        let api_key = resolve_api_key(provider, std::env::var("HIVE_API_KEY").ok());
        let workspace = std::env::var("HIVE_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".hive")
            });
        let port = std::env::var("HIVE_PORT")
            .ok()
            .map(|p| p.parse::<u16>())
            .transpose()
            .context("HIVE_PORT is not a valid port number")?
            .unwrap_or(7717);
        Ok(Self {
            provider,
            model,
            base_url,
            api_key,
            workspace,
            port,
        })
    }

    /// Path of the persisted graph document.
    pub fn graph_path(&self) -> PathBuf {
        self.workspace.join("system.json")
    }

    /// Effective provider settings for one agent: per-agent overrides applied
    /// on top of the runtime defaults.  An unrecognised per-agent provider
    /// string falls back to the runtime default kind.
    pub fn provider_settings(&self, data: &AgentData) -> ProviderSettings {
        let kind = data
            .provider
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.provider);
        let api_key = data
            .api_key
            .clone()
            .or_else(|| resolve_api_key(kind, self.api_key.clone()));
        ProviderSettings {
            kind,
            model: data.model.clone().unwrap_or_else(|| {
                if kind == self.provider {
                    self.model.clone()
                } else {
                    default_model(kind).to_string()
                }
            }),
            base_url: data.base_url.clone().or_else(|| self.base_url.clone()),
            api_key,
            max_tokens: data.max_tokens,
        }
    }
}

fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Anthropic => "claude-sonnet-4-5",
        ProviderKind::Openai => "gpt-4o",
        ProviderKind::Mock => "mock-model",
    }
}

/// Credential fallback chain: explicit value, then the provider's canonical
/// environment variable.
fn resolve_api_key(kind: ProviderKind, explicit: Option<String>) -> Option<String> {
    if explicit.is_some() {
        return explicit;
    }
    let var = match kind {
        ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        ProviderKind::Openai => "OPENAI_API_KEY",
        ProviderKind::Mock => return None,
    };
    std::env::var(var).ok()
}

/// Load the persisted graph.  A missing file yields the empty graph so a
/// fresh workspace starts cleanly.
pub fn load_graph(path: &Path) -> anyhow::Result<GraphSpec> {
    if !path.exists() {
        debug!(path = %path.display(), "no persisted graph; starting empty");
        return Ok(GraphSpec::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph from {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing graph at {}", path.display()))
}

/// Persist the graph atomically (write to a sibling temp file, then rename).
pub fn save_graph(path: &Path, graph: &GraphSpec) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(graph)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_graph_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let g = load_graph(&dir.path().join("system.json")).unwrap();
        assert!(g.agents.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.json");
        let graph: GraphSpec = serde_json::from_str(
            r#"{"agents": [{"id": "a", "name": "A", "data": {"system_prompt": "hi"}}]}"#,
        )
        .unwrap();
        save_graph(&path, &graph).unwrap();
        let back = load_graph(&path).unwrap();
        assert_eq!(back.agents.len(), 1);
        assert_eq!(back.agents[0].id, "a");
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/system.json");
        save_graph(&path, &GraphSpec::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_graph(&path).is_err());
    }

    #[test]
    fn provider_settings_prefers_agent_overrides() {
        let rc = RuntimeConfig {
            provider: ProviderKind::Anthropic,
            model: "claude-sonnet-4-5".into(),
            base_url: None,
            api_key: Some("default-key".into()),
            workspace: PathBuf::from("/tmp"),
            port: 7717,
        };
        let data = AgentData {
            provider: Some("openai".into()),
            model: Some("gpt-4o-mini".into()),
            api_key: Some("agent-key".into()),
            ..AgentData::default()
        };
        let settings = rc.provider_settings(&data);
        assert_eq!(settings.kind, ProviderKind::Openai);
        assert_eq!(settings.model, "gpt-4o-mini");
        assert_eq!(settings.api_key.as_deref(), Some("agent-key"));
    }

    #[test]
    fn provider_settings_falls_back_to_runtime_defaults() {
        let rc = RuntimeConfig {
            provider: ProviderKind::Mock,
            model: "mock-model".into(),
            base_url: Some("http://localhost:9".into()),
            api_key: None,
            workspace: PathBuf::from("/tmp"),
            port: 7717,
        };
        let settings = rc.provider_settings(&AgentData::default());
        assert_eq!(settings.kind, ProviderKind::Mock);
        assert_eq!(settings.model, "mock-model");
        assert_eq!(settings.base_url.as_deref(), Some("http://localhost:9"));
    }

    #[test]
    fn provider_settings_switching_kind_does_not_inherit_default_model() {
        // The runtime default model belongs to the runtime default provider;
        // an agent that overrides only the provider gets that provider's own
        // default model, not a cross-dialect model id.
        let rc = RuntimeConfig {
            provider: ProviderKind::Anthropic,
            model: "claude-sonnet-4-5".into(),
            base_url: None,
            api_key: None,
            workspace: PathBuf::from("/tmp"),
            port: 7717,
        };
        let data = AgentData {
            provider: Some("openai".into()),
            ..AgentData::default()
        };
        let settings = rc.provider_settings(&data);
        assert_eq!(settings.kind, ProviderKind::Openai);
        assert_eq!(settings.model, "gpt-4o");
    }
}
