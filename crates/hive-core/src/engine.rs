// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-agent conversation engine: a multi-turn tool-using loop over a
//! streaming model provider, with truncation detection, one-shot fault
//! recovery, and cooperative interruption.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hive_model::{
    AuthError, CompletionRequest, Message, ModelProvider, StopReason, StreamEvent, ToolSchema,
};
use hive_tools::{ToolContext, ToolRegistry};

use crate::events::EngineEvent;
use crate::session::{Session, DEFAULT_MAX_LEN};

/// Default cap on tool-using iterations per turn.
const DEFAULT_MAX_ITERATIONS: u32 = 30;

/// Configured caps below this are clamped up; a turn must always have room
/// for a few tool exchanges.
const MIN_MAX_ITERATIONS: u32 = 10;

/// Confirmation hook for the shell-execution built-in.  The UI adapter may
/// deny a command before it runs.
#[async_trait]
pub trait CommandGate: Send + Sync {
    async fn allow(&self, agent_id: &str, command: &str) -> bool;
}

pub struct ConversationEngine {
    agent_id: String,
    session: Session,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    max_iterations: u32,
    interrupt: Arc<AtomicBool>,
    command_gate: Option<Arc<dyn CommandGate>>,
}

/// What one provider stream produced.
struct Iteration {
    assistant: Message,
    stop_reason: StopReason,
    text: String,
}

impl ConversationEngine {
    pub fn new(
        agent_id: impl Into<String>,
        system_prompt: &str,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        max_iterations: Option<u32>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        let mut session = Session::new(DEFAULT_MAX_LEN);
        session.push(Message::system(system_prompt));
        Self {
            agent_id: agent_id.into(),
            session,
            provider,
            tools,
            max_iterations: max_iterations
                .unwrap_or(DEFAULT_MAX_ITERATIONS)
                .max(MIN_MAX_ITERATIONS),
            interrupt,
            command_gate: None,
        }
    }

    pub fn set_command_gate(&mut self, gate: Arc<dyn CommandGate>) {
        self.command_gate = Some(gate);
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Run one full turn.  Returns the concatenated text of all iterations.
    ///
    /// Every failure mode short of a rejected credential resolves into events
    /// plus a degraded reply; a single bad tool call or stream fault never
    /// kills the conversation.
    pub async fn talk(
        &mut self,
        user_text: &str,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> anyhow::Result<String> {
        self.interrupt.store(false, Ordering::SeqCst);
        self.session.push(Message::user(user_text));

        let mut turn_text = String::new();
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            if iterations > self.max_iterations {
                // The budget ran out mid-task; surface it as truncation so
                // the user can re-prompt with "continue".
                warn!(agent = %self.agent_id, "max iterations reached");
                let _ = tx.send(EngineEvent::TextComplete { truncated: true }).await;
                break;
            }

            let req = CompletionRequest {
                messages: self.session.messages_for_model(),
                tools: self.tool_schemas(),
                max_tokens: None,
            };

            let iteration = match self.run_stream(req, tx).await {
                Ok(it) => it,
                Err(e) if e.downcast_ref::<AuthError>().is_some() => return Err(e),
                Err(e) => {
                    // Stream fault: restore the pairing invariant, tell the
                    // UI, then degrade to a single tool-free pass.
                    self.restore_pairing();
                    let _ = tx
                        .send(EngineEvent::Error {
                            message: format!("{e:#}"),
                        })
                        .await;
                    let text = self.fallback_stream(tx).await?;
                    turn_text.push_str(&text);
                    break;
                }
            };

            let truncated = !iteration.stop_reason.is_natural();
            turn_text.push_str(&iteration.text);

            let Message::Assistant { text, tool_calls } = iteration.assistant.clone() else {
                return Err(anyhow!("provider completed with a non-assistant message"));
            };

            if tool_calls.is_empty() {
                if text.as_deref().is_some_and(|t| !t.is_empty()) {
                    self.session.push(iteration.assistant);
                }
                let _ = tx.send(EngineEvent::TextComplete { truncated }).await;
                break;
            }

            // Pairing anchor: the whole assistant message (text + calls) goes
            // into the log before any tool runs.
            self.session.push(iteration.assistant);
            if text.as_deref().is_some_and(|t| !t.is_empty()) {
                let _ = tx.send(EngineEvent::TextPartComplete).await;
            }

            for call in &tool_calls {
                let args = call.parsed_arguments();
                let result = if call.name == "run_command" && self.command_denied(&args).await {
                    "user denied command execution".to_string()
                } else {
                    let _ = tx
                        .send(EngineEvent::ToolExec {
                            name: call.name.clone(),
                        })
                        .await;
                    let ctx = ToolContext {
                        agent_id: self.agent_id.clone(),
                    };
                    self.tools.dispatch(&call.name, &args, &ctx).await
                };
                // Pairing preserved mid-iteration: the result lands right
                // after its anchor.
                self.session.push(Message::tool_result(&call.id, result));
                let _ = tx.send(EngineEvent::ToolResult).await;
            }

            if truncated {
                // The model ran out of budget even to finish its tool
                // requests; do not loop on a half-finished plan.
                let _ = tx.send(EngineEvent::TextComplete { truncated: true }).await;
                break;
            }
            if self.interrupt.load(Ordering::SeqCst) {
                debug!(agent = %self.agent_id, "interrupted between iterations");
                let _ = tx.send(EngineEvent::TextComplete { truncated: false }).await;
                break;
            }
        }

        Ok(turn_text)
    }

    async fn command_denied(&self, args: &serde_json::Value) -> bool {
        let Some(gate) = &self.command_gate else {
            return false;
        };
        let command = args.get("command").and_then(|c| c.as_str()).unwrap_or("");
        !gate.allow(&self.agent_id, command).await
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect()
    }

    /// Consume one provider stream, forwarding each event onward, and return
    /// the assembled assistant message with its stop reason.
    async fn run_stream(
        &mut self,
        req: CompletionRequest,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> anyhow::Result<Iteration> {
        let mut stream = self.provider.stream(req).await?;
        let mut text = String::new();
        let mut call_names: HashMap<String, String> = HashMap::new();
        let mut thinking_streamed = false;
        let mut completed = None;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::ThinkingStart => {
                    thinking_streamed = false;
                    let _ = tx.send(EngineEvent::ThinkingStart).await;
                }
                StreamEvent::ThinkingDelta { text } => {
                    thinking_streamed = true;
                    let _ = tx.send(EngineEvent::ThinkingDelta { text }).await;
                }
                StreamEvent::ThinkingEnd { full_text } => {
                    if !thinking_streamed && !full_text.is_empty() {
                        let _ = tx
                            .send(EngineEvent::ThinkingHidden {
                                length: full_text.len(),
                            })
                            .await;
                    } else {
                        let _ = tx.send(EngineEvent::ThinkingEnd { full_text }).await;
                    }
                }
                StreamEvent::TextDelta { text: delta } => {
                    text.push_str(&delta);
                    let _ = tx.send(EngineEvent::TextDelta { text: delta }).await;
                }
                StreamEvent::ToolStart { call_id, name } => {
                    call_names.insert(call_id, name.clone());
                    let _ = tx.send(EngineEvent::ToolStart { name }).await;
                }
                StreamEvent::ToolArgDelta { .. } => {}
                StreamEvent::ToolEnd {
                    call_id,
                    parsed_input,
                } => {
                    let name = call_names.get(&call_id).cloned().unwrap_or_default();
                    let _ = tx.send(EngineEvent::ToolEnd { name, parsed_input }).await;
                }
                StreamEvent::MessageComplete {
                    message,
                    stop_reason,
                } => {
                    completed = Some((message, stop_reason));
                }
            }
        }

        let (assistant, stop_reason) =
            completed.ok_or_else(|| anyhow!("provider stream ended without completion"))?;
        Ok(Iteration {
            assistant,
            stop_reason,
            text,
        })
    }

    /// One degraded pass with an empty tool list.  No retries beyond this.
    async fn fallback_stream(&mut self, tx: &mpsc::Sender<EngineEvent>) -> anyhow::Result<String> {
        let req = CompletionRequest {
            messages: self.session.messages_for_model(),
            tools: Vec::new(),
            max_tokens: None,
        };
        let iteration = self.run_stream(req, tx).await?;
        let truncated = !iteration.stop_reason.is_natural();
        if !iteration.text.is_empty() {
            self.session.push(Message::assistant(&iteration.text));
        }
        let _ = tx.send(EngineEvent::TextComplete { truncated }).await;
        Ok(iteration.text)
    }

    /// Restore the pairing invariant before a retry: a trailing
    /// assistant-with-tool-calls whose result set is incomplete is removed
    /// together with whatever results it did receive.
    fn restore_pairing(&mut self) {
        let mut results = Vec::new();
        while matches!(self.session.last(), Some(Message::ToolResult { .. })) {
            results.push(self.session.pop().expect("checked non-empty"));
        }
        match self.session.last() {
            Some(Message::Assistant { tool_calls, .. }) if !tool_calls.is_empty() => {
                let expected: std::collections::HashSet<&str> =
                    tool_calls.iter().map(|c| c.id.as_str()).collect();
                let answered: std::collections::HashSet<&str> = results
                    .iter()
                    .filter_map(|m| match m {
                        Message::ToolResult { call_id, .. } => Some(call_id.as_str()),
                        _ => None,
                    })
                    .collect();
                if expected == answered {
                    for r in results.into_iter().rev() {
                        self.session.push(r);
                    }
                } else {
                    self.session.pop();
                }
            }
            _ => {
                for r in results.into_iter().rev() {
                    self.session.push(r);
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
