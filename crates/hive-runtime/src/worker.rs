// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One stateful worker per agent: serialises ingress through a single-slot
//! busy flag, runs the engine, and adapts engine events to the outward wire
//! protocol tagged with this agent's id.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use hive_config::{AgentSpec, ProviderSettings};
use hive_core::{ConversationEngine, EngineEvent};
use hive_model::ModelProvider;
use hive_tools::ToolRegistry;

use crate::fanout::OutboundEvent;
use crate::journal;

/// Result of an ingress attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TalkOutcome {
    /// The turn ran to completion; carries the final text.
    Completed(String),
    /// The worker was mid-turn; the message was dropped, not queued.
    Busy,
    /// The turn failed fatally (e.g. rejected credential).
    Failed(String),
}

pub struct AgentWorker {
    id: String,
    name: String,
    description: String,
    settings: ProviderSettings,
    engine: Mutex<ConversationEngine>,
    busy: AtomicBool,
    interrupt: Arc<AtomicBool>,
    retired: AtomicBool,
    events: broadcast::Sender<OutboundEvent>,
    workspace: PathBuf,
}

impl AgentWorker {
    /// Construct and initialise the worker: the engine is created with the
    /// assembled system prompt and is ready before any message is accepted.
    pub fn new(
        spec: &AgentSpec,
        system_prompt: String,
        settings: ProviderSettings,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        events: broadcast::Sender<OutboundEvent>,
        workspace: PathBuf,
    ) -> Arc<Self> {
        let interrupt = Arc::new(AtomicBool::new(false));
        let engine = ConversationEngine::new(
            spec.id.clone(),
            &system_prompt,
            provider,
            tools,
            spec.data.max_iterations,
            Arc::clone(&interrupt),
        );
        Arc::new(Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            description: spec.data.system_prompt.clone(),
            settings,
            engine: Mutex::new(engine),
            busy: AtomicBool::new(false),
            interrupt,
            retired: AtomicBool::new(false),
            events,
            workspace,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The agent's own prompt, doubling as its roster description.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Set the engine's interrupt flag; honoured at the next safe point.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Retire this worker after a reload: it forwards nothing further and the
    /// current turn is asked to wind down.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.interrupt();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Snapshot of the current session log (for the history endpoint).
    pub async fn session_log(&self) -> Vec<hive_model::Message> {
        self.engine.lock().await.session().log.clone()
    }

    /// Run one turn end-to-end.  Non-reentrant: a busy worker rejects
    /// immediately without queueing.
    pub async fn talk(self: &Arc<Self>, text: &str) -> TalkOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(agent = %self.id, "busy; dropping message");
            return TalkOutcome::Busy;
        }

        if let Err(e) = journal::append(&self.workspace, &self.id, "user", text) {
            warn!(agent = %self.id, "journal append failed: {e:#}");
        }

        let (tx, rx) = mpsc::channel(256);
        let forwarder = tokio::spawn(forward_events(
            rx,
            self.id.clone(),
            self.events.clone(),
            Arc::clone(self),
        ));

        let result = {
            let mut engine = self.engine.lock().await;
            engine.talk(text, &tx).await
        };
        drop(tx);
        let _ = forwarder.await;

        self.busy.store(false, Ordering::SeqCst);

        match result {
            Ok(reply) => {
                if !reply.is_empty() {
                    if let Err(e) = journal::append(&self.workspace, &self.id, "assistant", &reply)
                    {
                        warn!(agent = %self.id, "journal append failed: {e:#}");
                    }
                }
                TalkOutcome::Completed(reply)
            }
            Err(e) => {
                let message = format!("agent {} failed: {e:#}", self.id);
                warn!("{message}");
                if !self.is_retired() {
                    let _ = self.events.send(OutboundEvent::Error {
                        message: message.clone(),
                    });
                }
                TalkOutcome::Failed(message)
            }
        }
    }
}

/// Adapt engine events to the wire protocol.  Message text accumulates across
/// the turn so `message_end` can carry the full text.  A retired worker's
/// events are discarded.
async fn forward_events(
    mut rx: mpsc::Receiver<EngineEvent>,
    agent_id: String,
    events: broadcast::Sender<OutboundEvent>,
    worker: Arc<AgentWorker>,
) {
    let mut full_text = String::new();
    while let Some(event) = rx.recv().await {
        let outbound = match event {
            EngineEvent::ThinkingStart => OutboundEvent::ThinkingStart {
                agent_id: agent_id.clone(),
            },
            EngineEvent::ThinkingDelta { text } => OutboundEvent::ThinkingDelta {
                agent_id: agent_id.clone(),
                text,
            },
            EngineEvent::ThinkingEnd { full_text } => OutboundEvent::ThinkingEnd {
                agent_id: agent_id.clone(),
                full_text,
            },
            EngineEvent::ThinkingHidden { length } => OutboundEvent::ThinkingHidden {
                agent_id: agent_id.clone(),
                length,
            },
            EngineEvent::TextDelta { text } => {
                full_text.push_str(&text);
                OutboundEvent::MessageDelta {
                    agent_id: agent_id.clone(),
                    text,
                }
            }
            // Iteration boundary; not part of the wire protocol.
            EngineEvent::TextPartComplete => continue,
            EngineEvent::TextComplete { truncated } => OutboundEvent::MessageEnd {
                agent_id: agent_id.clone(),
                full_text: full_text.clone(),
                truncated,
            },
            EngineEvent::ToolStart { name } => OutboundEvent::ToolStart {
                agent_id: agent_id.clone(),
                name,
            },
            EngineEvent::ToolEnd { name, parsed_input } => OutboundEvent::ToolEnd {
                agent_id: agent_id.clone(),
                name,
                input: parsed_input,
            },
            EngineEvent::ToolExec { name } => OutboundEvent::ToolExec {
                agent_id: agent_id.clone(),
                name,
            },
            EngineEvent::ToolResult => OutboundEvent::ToolResult {
                agent_id: agent_id.clone(),
            },
            EngineEvent::Error { message } => OutboundEvent::Error { message },
        };
        if worker.is_retired() {
            continue;
        }
        // Send errors only mean no subscribers; events are lossy by design.
        let _ = events.send(outbound);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
