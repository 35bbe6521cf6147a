// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The system controller: owns the live graph, the worker map, the tool
//! registry, the external tool connections, and the event fan-out.  Reloads
//! are atomic from the outside.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use hive_config::{AgentSpec, GraphSpec, ProviderSettings, RuntimeConfig};
use hive_mcp_client::ExternalToolManager;
use hive_model::ModelProvider;
use hive_tools::{AskUserTool, RunCommandTool, TaskCompleteTool, ToolRegistry};

use crate::bus::{ListAgentsTool, MessageBus, SendMessageTool};
use crate::fanout::OutboundEvent;
use crate::journal;
use crate::scheduler::{self, SchedulerHandle};
use crate::worker::{AgentWorker, TalkOutcome};

/// Builds a provider for one agent.  The default wraps
/// [`hive_model::from_config`]; tests substitute scripted providers.
pub type ProviderFactory =
    Arc<dyn Fn(&ProviderSettings, &str) -> Arc<dyn ModelProvider> + Send + Sync>;

/// One line of the history endpoint's response.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryMessage {
    pub role: String,
    pub agent: String,
    pub content: String,
}

struct ControllerState {
    graph: GraphSpec,
    workers: Vec<Arc<AgentWorker>>,
    edges: HashSet<(String, String)>,
    scheduler: Option<SchedulerHandle>,
}

pub struct SystemController {
    runtime: RuntimeConfig,
    registry: Arc<ToolRegistry>,
    external: Arc<ExternalToolManager>,
    events: broadcast::Sender<OutboundEvent>,
    provider_factory: ProviderFactory,
    state: RwLock<ControllerState>,
    ready: AtomicBool,
}

impl SystemController {
    pub fn new(runtime: RuntimeConfig) -> Arc<Self> {
        Self::with_provider_factory(
            runtime,
            Arc::new(|settings, _agent_id| hive_model::from_config(settings)),
        )
    }

    pub fn with_provider_factory(runtime: RuntimeConfig, factory: ProviderFactory) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let controller = Arc::new_cyclic(|weak| {
            let registry = Arc::new(ToolRegistry::new());
            registry.register(RunCommandTool::default());
            registry.register(TaskCompleteTool);
            registry.register(AskUserTool);
            let bus = Arc::new(MessageBus::new(weak.clone()));
            registry.register(SendMessageTool {
                bus: Arc::clone(&bus),
            });
            registry.register(ListAgentsTool { bus });

            let external = Arc::new(ExternalToolManager::new());
            registry.set_external_router(Arc::clone(&external) as Arc<dyn hive_tools::ExternalDispatch>);

            Self {
                runtime,
                registry,
                external,
                events,
                provider_factory: factory,
                state: RwLock::new(ControllerState {
                    graph: GraphSpec::default(),
                    workers: Vec::new(),
                    edges: HashSet::new(),
                    scheduler: None,
                }),
                ready: AtomicBool::new(false),
            }
        });
        controller
    }

    pub fn workspace(&self) -> &Path {
        &self.runtime.workspace
    }

    pub fn port(&self) -> u16 {
        self.runtime.port
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.events.subscribe()
    }

    pub fn broadcast(&self, event: OutboundEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn build_provider(
        &self,
        settings: &ProviderSettings,
        agent_id: &str,
    ) -> Arc<dyn ModelProvider> {
        (self.provider_factory)(settings, agent_id)
    }

    /// Atomically replace the running system with `new_graph`.
    ///
    /// While the reload runs, UI traffic is rejected with "system not
    /// initialised".  A bad agent entry or a failing external server is
    /// skipped; the rest of the graph still loads.
    pub async fn load_or_reload(self: &Arc<Self>, new_graph: GraphSpec) -> anyhow::Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        let mut state = self.state.write().await;

        if let Some(handle) = state.scheduler.take() {
            handle.stop().await;
        }
        self.external.disconnect_all().await;
        for worker in &state.workers {
            worker.retire();
        }
        state.workers.clear();

        for problem in new_graph.validate() {
            warn!("graph problem: {problem}");
        }
        state.edges = new_graph.edges();

        self.external
            .connect_all(&new_graph.external_tool_servers)
            .await;

        let mut seen = HashSet::new();
        for spec in &new_graph.agents {
            if spec.id.is_empty() || !seen.insert(spec.id.clone()) {
                continue;
            }
            let settings = self.runtime.provider_settings(&spec.data);
            let provider = self.build_provider(&settings, &spec.id);
            let prompt = assemble_system_prompt(spec, &new_graph);
            let worker = AgentWorker::new(
                spec,
                prompt,
                settings,
                provider,
                Arc::clone(&self.registry),
                self.events.clone(),
                self.runtime.workspace.clone(),
            );
            state.workers.push(worker);
        }

        state.scheduler = Some(scheduler::start(Arc::downgrade(self), &new_graph));
        info!(
            agents = state.workers.len(),
            connections = new_graph.connections.len(),
            "graph loaded"
        );
        state.graph = new_graph;
        drop(state);

        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop timers and external servers on process shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        self.ready.store(false, Ordering::SeqCst);
        let mut state = self.state.write().await;
        if let Some(handle) = state.scheduler.take() {
            handle.stop().await;
        }
        for worker in &state.workers {
            worker.retire();
        }
        state.workers.clear();
        drop(state);
        self.external.disconnect_all().await;
    }

    fn ensure_ready(&self) -> Result<(), String> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("system not initialised".into())
        }
    }

    pub async fn worker(&self, id: &str) -> Option<Arc<AgentWorker>> {
        self.state
            .read()
            .await
            .workers
            .iter()
            .find(|w| w.id() == id)
            .cloned()
    }

    pub async fn workers_snapshot(&self) -> Vec<Arc<AgentWorker>> {
        self.state.read().await.workers.clone()
    }

    pub async fn edge_allowed(&self, source: &str, target: &str) -> bool {
        self.state
            .read()
            .await
            .edges
            .contains(&(source.to_string(), target.to_string()))
    }

    pub async fn current_graph(&self) -> GraphSpec {
        self.state.read().await.graph.clone()
    }

    /// Deliver a user message: to the named agent, or to the first agent by
    /// declaration order.  Never creates workers.
    pub async fn handle_user_message(
        &self,
        content: String,
        target_agent_id: Option<String>,
    ) -> Result<(), String> {
        self.ensure_ready()?;
        let worker = match &target_agent_id {
            Some(id) => self
                .worker(id)
                .await
                .ok_or_else(|| format!("agent not found: {id}"))?,
            None => self
                .state
                .read()
                .await
                .workers
                .first()
                .cloned()
                .ok_or_else(|| "no agents configured".to_string())?,
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            if worker.talk(&content).await == TalkOutcome::Busy {
                let _ = events.send(OutboundEvent::Error {
                    message: format!("agent {} is busy; message dropped", worker.id()),
                });
            }
        });
        Ok(())
    }

    /// Set an agent's interrupt flag (first agent when no target is named).
    pub async fn interrupt(&self, target_agent_id: Option<String>) -> Result<(), String> {
        self.ensure_ready()?;
        let worker = match &target_agent_id {
            Some(id) => self
                .worker(id)
                .await
                .ok_or_else(|| format!("agent not found: {id}"))?,
            None => self
                .state
                .read()
                .await
                .workers
                .first()
                .cloned()
                .ok_or_else(|| "no agents configured".to_string())?,
        };
        worker.interrupt();
        Ok(())
    }

    /// History for one agent: today's journal entries, plus any session text
    /// not yet journaled (an in-flight turn).
    pub async fn agent_history(&self, id: &str) -> Result<Vec<HistoryMessage>, String> {
        self.ensure_ready()?;
        let worker = self
            .worker(id)
            .await
            .ok_or_else(|| format!("agent not found: {id}"))?;
        let today = chrono::Local::now().date_naive();
        let mut messages: Vec<HistoryMessage> =
            journal::entries_for_day(&self.runtime.workspace, id, today)
                .into_iter()
                .map(|e| HistoryMessage {
                    role: e.role,
                    agent: id.to_string(),
                    content: e.content,
                })
                .collect();
        for msg in worker.session_log().await {
            let (role, content) = match &msg {
                hive_model::Message::User { content } => ("user", content.clone()),
                hive_model::Message::Assistant { text: Some(t), .. } if !t.is_empty() => {
                    ("assistant", t.clone())
                }
                _ => continue,
            };
            if !messages.iter().any(|m| m.content == content) {
                messages.push(HistoryMessage {
                    role: role.into(),
                    agent: id.to_string(),
                    content,
                });
            }
        }
        Ok(messages)
    }
}

/// The prompt a worker's engine starts from: the agent's own prompt plus the
/// roster of peers it can reach over outgoing edges.
fn assemble_system_prompt(spec: &AgentSpec, graph: &GraphSpec) -> String {
    let mut prompt = spec.data.system_prompt.clone();
    let peers: Vec<&AgentSpec> = graph
        .connections
        .iter()
        .filter(|c| c.source == spec.id)
        .filter_map(|c| graph.agents.iter().find(|a| a.id == c.target))
        .collect();
    if !peers.is_empty() {
        prompt.push_str("\n\n## Organisation\nYou can message these agents with send_message:\n");
        for peer in peers {
            let mut desc = peer.data.system_prompt.clone();
            if desc.len() > 100 {
                let mut end = 100;
                while end > 0 && !desc.is_char_boundary(end) {
                    end -= 1;
                }
                desc.truncate(end);
                desc.push('…');
            }
            prompt.push_str(&format!("- {} ({}): {}\n", peer.id, peer.name, desc));
        }
    }
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
