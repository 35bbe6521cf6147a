// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::{AuthError, EventStream},
    CompletionRequest, Message, ModelProvider, StopReason, StreamEvent, ToolCallRequest,
};

/// One scripted provider call.
pub enum Script {
    /// Emit these items in order; `Err` entries become stream faults.
    Events(Vec<Result<StreamEvent, String>>),
    /// Fail the `stream` call itself (connection refused, 5xx, ...).
    ConnectError(String),
    /// Fail the `stream` call with a fatal authentication error.
    AuthFailure(String),
}

/// A pre-scripted provider.  Each `stream` call pops the next script from the
/// front of the queue, so tests can specify exact event sequences — including
/// tool calls and injected faults — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    /// Every request seen, in call order, for post-hoc assertions (e.g. the
    /// fallback pass must carry an empty tool list).
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script for a plain text reply ending naturally.
    pub fn text_reply(text: &str) -> Script {
        Self::text_with_stop(text, StopReason::EndTurn)
    }

    pub fn text_with_stop(text: &str, stop_reason: StopReason) -> Script {
        Script::Events(vec![
            Ok(StreamEvent::TextDelta { text: text.into() }),
            Ok(StreamEvent::MessageComplete {
                message: Message::assistant(text),
                stop_reason,
            }),
        ])
    }

    /// Script for a turn that requests the given tool calls.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Script {
        Self::tool_calls_with_stop(calls, StopReason::ToolUse)
    }

    pub fn tool_calls_with_stop(calls: &[(&str, &str, &str)], stop_reason: StopReason) -> Script {
        let mut events = Vec::new();
        let mut requests = Vec::new();
        for (id, name, args) in calls {
            events.push(Ok(StreamEvent::ToolStart {
                call_id: (*id).into(),
                name: (*name).into(),
            }));
            events.push(Ok(StreamEvent::ToolArgDelta {
                call_id: (*id).into(),
                json_fragment: (*args).into(),
            }));
            events.push(Ok(StreamEvent::ToolEnd {
                call_id: (*id).into(),
                parsed_input: serde_json::from_str(args)
                    .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
            }));
            requests.push(ToolCallRequest {
                id: (*id).into(),
                name: (*name).into(),
                arguments: (*args).into(),
            });
        }
        events.push(Ok(StreamEvent::MessageComplete {
            message: Message::assistant_with_tools(None, requests),
            stop_reason,
        }));
        Script::Events(events)
    }

    /// Script that streams some text then dies mid-stream.
    pub fn fault_after(text: &str, error: &str) -> Script {
        Script::Events(vec![
            Ok(StreamEvent::TextDelta { text: text.into() }),
            Err(error.into()),
        ])
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        self.requests.lock().unwrap().push(req);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted provider exhausted"))?;
        match script {
            Script::ConnectError(msg) => anyhow::bail!("{msg}"),
            Script::AuthFailure(msg) => Err(anyhow::anyhow!(AuthError(msg))),
            Script::Events(items) => {
                let events: Vec<anyhow::Result<StreamEvent>> = items
                    .into_iter()
                    .map(|item| item.map_err(|e| anyhow::anyhow!("{e}")))
                    .collect();
                Ok(Box::pin(stream::iter(events)))
            }
        }
    }
}

/// Deterministic echo provider for smoke tests and the `mock` provider kind.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "[no input]".into());
        let text = format!("MOCK: {reply}");
        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta { text: text.clone() }),
            Ok(StreamEvent::MessageComplete {
                message: Message::assistant(text),
                stop_reason: StopReason::EndTurn,
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn echo_provider_replies_to_last_user_message() {
        let p = EchoProvider;
        let req = CompletionRequest {
            messages: vec![Message::user("ping")],
            ..Default::default()
        };
        let mut s = p.stream(req).await.unwrap();
        let first = s.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamEvent::TextDelta { text } if text == "MOCK: ping"));
    }

    #[tokio::test]
    async fn scripted_provider_pops_scripts_in_order() {
        let p = ScriptedProvider::new(vec![
            ScriptedProvider::text_reply("first"),
            ScriptedProvider::text_reply("second"),
        ]);
        for expected in ["first", "second"] {
            let mut s = p.stream(CompletionRequest::default()).await.unwrap();
            let ev = s.next().await.unwrap().unwrap();
            assert!(matches!(ev, StreamEvent::TextDelta { text } if text == expected));
        }
        assert!(p.stream(CompletionRequest::default()).await.is_err());
    }

    #[tokio::test]
    async fn fault_script_yields_err_item_mid_stream() {
        let p = ScriptedProvider::new(vec![ScriptedProvider::fault_after("partial", "boom")]);
        let mut s = p.stream(CompletionRequest::default()).await.unwrap();
        assert!(s.next().await.unwrap().is_ok());
        assert!(s.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn complete_text_drains_a_tool_free_stream() {
        let p = ScriptedProvider::new(vec![ScriptedProvider::text_reply("reflection notes")]);
        let text = p.complete_text("sys", "prompt").await.unwrap();
        assert_eq!(text, "reflection notes");
        let requests = p.requests.lock().unwrap();
        assert!(requests[0].tools.is_empty());
    }
}
