// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Dialect A — the message-structured wire format.
//!
//! The system prompt is a separate top-level field; assistant turns carry
//! typed content blocks; tool calls arrive as `tool_use` blocks whose input
//! streams as JSON fragments under `input_json_delta`; tool results go back
//! as `user` messages containing `tool_result` blocks.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    provider::{AuthError, EventStream},
    CompletionRequest, Message, ModelProvider, StopReason, StreamEvent, ToolCallRequest,
};

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!(AuthError("ANTHROPIC_API_KEY not set".into())))?;

        let (system_text, messages) = build_anthropic_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "stream": true,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(model = %self.model, tool_count = tools.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(AuthError(format!("anthropic rejected credential: {text}"))));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("anthropic error {status}: {text}");
        }

        // SSE lines can be split across TCP chunks; the assembly task keeps a
        // remainder buffer and only parses complete lines.
        let (tx, rx) = mpsc::channel(64);
        let mut byte_stream = resp.bytes_stream();
        tokio::spawn(async move {
            let mut buf = String::new();
            let mut assembly = EventAssembly::default();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow!(e).context("anthropic stream aborted")))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
                        continue;
                    };
                    for event in assembly.feed(&v) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ─── Stream assembly ──────────────────────────────────────────────────────────

#[derive(Debug)]
enum Block {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        args: String,
    },
}

/// Folds raw wire events into the unified protocol, assembling the final
/// assistant message block by block.
#[derive(Default)]
pub(crate) struct EventAssembly {
    blocks: BTreeMap<u64, Block>,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl EventAssembly {
    pub(crate) fn feed(&mut self, v: &Value) -> Vec<anyhow::Result<StreamEvent>> {
        if self.done {
            return Vec::new();
        }
        let mut out = Vec::new();
        match v["type"].as_str().unwrap_or("") {
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "tool_use" => {
                        let id = block["id"].as_str().unwrap_or("").to_string();
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        out.push(Ok(StreamEvent::ToolStart {
                            call_id: id.clone(),
                            name: name.clone(),
                        }));
                        self.blocks.insert(
                            index,
                            Block::ToolUse {
                                id,
                                name,
                                args: String::new(),
                            },
                        );
                    }
                    "thinking" => {
                        out.push(Ok(StreamEvent::ThinkingStart));
                        self.blocks.insert(index, Block::Thinking(String::new()));
                    }
                    _ => {
                        self.blocks.insert(index, Block::Text(String::new()));
                    }
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("").to_string();
                        if let Some(Block::Text(buf)) = self.blocks.get_mut(&index) {
                            buf.push_str(&text);
                        }
                        if !text.is_empty() {
                            out.push(Ok(StreamEvent::TextDelta { text }));
                        }
                    }
                    "input_json_delta" => {
                        let fragment = delta["partial_json"].as_str().unwrap_or("").to_string();
                        if let Some(Block::ToolUse { id, args, .. }) = self.blocks.get_mut(&index) {
                            args.push_str(&fragment);
                            if !fragment.is_empty() {
                                out.push(Ok(StreamEvent::ToolArgDelta {
                                    call_id: id.clone(),
                                    json_fragment: fragment,
                                }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        let text = delta["thinking"].as_str().unwrap_or("").to_string();
                        if let Some(Block::Thinking(buf)) = self.blocks.get_mut(&index) {
                            buf.push_str(&text);
                        }
                        if !text.is_empty() {
                            out.push(Ok(StreamEvent::ThinkingDelta { text }));
                        }
                    }
                    // Encrypted integrity blob at the end of a thinking block;
                    // never surfaced.
                    "signature_delta" => {}
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                match self.blocks.get(&index) {
                    Some(Block::Thinking(buf)) => {
                        out.push(Ok(StreamEvent::ThinkingEnd {
                            full_text: buf.clone(),
                        }));
                    }
                    Some(Block::ToolUse { id, args, .. }) => {
                        let parsed: Value = serde_json::from_str(args)
                            .unwrap_or_else(|_| Value::Object(Default::default()));
                        out.push(Ok(StreamEvent::ToolEnd {
                            call_id: id.clone(),
                            parsed_input: parsed,
                        }));
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(map_stop_reason(reason));
                }
            }
            "message_stop" => {
                self.done = true;
                out.push(Ok(StreamEvent::MessageComplete {
                    message: self.assemble_message(),
                    stop_reason: self.final_stop_reason(),
                }));
            }
            "error" => {
                self.done = true;
                let message = v["error"]["message"].as_str().unwrap_or("unknown error");
                out.push(Err(anyhow!("anthropic stream error: {message}")));
            }
            // ping and future event types
            _ => {}
        }
        out
    }

    fn assemble_message(&self) -> Message {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in self.blocks.values() {
            match block {
                Block::Text(t) => text.push_str(t),
                Block::Thinking(_) => {}
                Block::ToolUse { id, name, args } => {
                    let id = if id.is_empty() {
                        // A missing content_block_start leaves the id empty;
                        // the wire format rejects empty ids on the way back.
                        warn!(tool = %name, "tool_use block had no id; substituting fallback");
                        format!("toolu_fallback_{}", tool_calls.len())
                    } else {
                        id.clone()
                    };
                    tool_calls.push(ToolCallRequest {
                        id,
                        name: name.clone(),
                        arguments: args.clone(),
                    });
                }
            }
        }
        Message::Assistant {
            text: if text.is_empty() { None } else { Some(text) },
            tool_calls,
        }
    }

    fn final_stop_reason(&self) -> StopReason {
        self.stop_reason.unwrap_or_else(|| {
            if self.blocks.values().any(|b| matches!(b, Block::ToolUse { .. })) {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            }
        })
    }
}

fn map_stop_reason(s: &str) -> StopReason {
    match s {
        "end_turn" => StopReason::EndTurn,
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::Other,
    }
}

// ─── Wire encoding ────────────────────────────────────────────────────────────

/// Render the canonical log into this dialect.
///
/// Returns `(system_text, conversation_messages)`: the system entry becomes
/// the top-level `system` field, an assistant entry with tool calls becomes a
/// single message with mixed `text` + `tool_use` blocks, and each tool result
/// becomes a synthetic `user` message carrying a `tool_result` block.
pub(crate) fn build_anthropic_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out = Vec::new();

    for m in messages {
        match m {
            Message::System { content } => system_text = content.clone(),
            Message::User { content } => {
                out.push(json!({ "role": "user", "content": content }));
            }
            Message::Assistant { text, tool_calls } => {
                if tool_calls.is_empty() {
                    out.push(json!({
                        "role": "assistant",
                        "content": text.clone().unwrap_or_default(),
                    }));
                    continue;
                }
                let mut content = Vec::new();
                if let Some(t) = text {
                    if !t.is_empty() {
                        content.push(json!({ "type": "text", "text": t }));
                    }
                }
                for call in tool_calls {
                    // Argument JSON is re-parsed on emission; malformed text
                    // degrades to an empty object so the call id still pairs.
                    content.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.parsed_arguments(),
                    }));
                }
                out.push(json!({ "role": "assistant", "content": content }));
            }
            Message::ToolResult { call_id, content } => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": content,
                    }]
                }));
            }
        }
    }
    (system_text, out)
}

/// Decode a wire-format assistant message (a `content` block array) back into
/// a canonical assistant entry.  The inverse of the assistant arm of
/// [`build_anthropic_messages`].
pub(crate) fn decode_assistant_content(content: &[Value]) -> Message {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content {
        match block["type"].as_str().unwrap_or("") {
            "text" => text.push_str(block["text"].as_str().unwrap_or("")),
            "tool_use" => tool_calls.push(ToolCallRequest {
                id: block["id"].as_str().unwrap_or("").to_string(),
                name: block["name"].as_str().unwrap_or("").to_string(),
                arguments: block["input"].to_string(),
            }),
            _ => {}
        }
    }
    Message::Assistant {
        text: if text.is_empty() { None } else { Some(text) },
        tool_calls,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
