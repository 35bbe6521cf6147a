// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Dialect B — the chat-completions wire format.
//!
//! The system prompt is an in-band role; tool calls arrive as `tool_calls`
//! deltas with accumulating argument strings keyed by index; tool results go
//! back as `tool` role entries keyed by `tool_call_id`.  Reasoning content may
//! arrive on a side channel (`reasoning_content` / `reasoning`) which this
//! codec rewrites as thinking events.

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

pub struct OpenAiProvider {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
    ) -> Self {
        let base = base_url.unwrap_or_else(|| "https://api.openai.com/v1".into());
        Self {
            model,
            api_key,
            chat_url: format!("{}/chat/completions", base.trim_end_matches('/')),
            max_tokens: max_tokens.unwrap_or(4096),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!(AuthError("OPENAI_API_KEY not set".into())))?;

        let messages = build_openai_messages(&req.messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(model = %self.model, tool_count = tools.len(), "sending chat-completions request");

        let resp = self
            .client
            .post(&self.chat_url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("chat-completions request failed")?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(AuthError(format!("provider rejected credential: {text}"))));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("chat-completions error {status}: {text}");
        }

        let (tx, rx) = mpsc::channel(64);
        let mut byte_stream = resp.bytes_stream();
        tokio::spawn(async move {
            let mut buf = String::new();
            let mut assembly = ChatAssembly::default();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow!(e).context("chat-completions stream aborted")))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    for event in assembly.feed_line(&line) {
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

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    args: String,
    announced: bool,
}

/// Folds chat-completions SSE chunks into the unified protocol.
///
/// Parallel tool calls interleave by `index`; other fields accumulate until
/// the `[DONE]` sentinel closes the message.
#[derive(Default)]
pub(crate) struct ChatAssembly {
    pending: BTreeMap<u64, PendingCall>,
    text: String,
    thinking: String,
    thinking_open: bool,
    finish_reason: Option<StopReason>,
    done: bool,
}

impl ChatAssembly {
    pub(crate) fn feed_line(&mut self, line: &str) -> Vec<anyhow::Result<StreamEvent>> {
        if self.done {
            return Vec::new();
        }
        let Some(data) = line.strip_prefix("data: ") else {
            return Vec::new();
        };
        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish();
        }
        let Ok(v) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        self.feed_chunk(&v)
    }

    fn feed_chunk(&mut self, v: &Value) -> Vec<anyhow::Result<StreamEvent>> {
        let mut out = Vec::new();
        let choice = &v["choices"][0];

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(map_finish_reason(reason));
        }

        let delta = &choice["delta"];

        if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
            for tc in calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                let entry = self.pending.entry(index).or_default();
                if let Some(id) = tc["id"].as_str().filter(|s| !s.is_empty()) {
                    entry.id = id.to_string();
                }
                if let Some(name) = tc["function"]["name"].as_str().filter(|s| !s.is_empty()) {
                    entry.name = name.to_string();
                }
                if !entry.announced && !entry.name.is_empty() {
                    entry.announced = true;
                    out.push(Ok(StreamEvent::ToolStart {
                        call_id: entry.id.clone(),
                        name: entry.name.clone(),
                    }));
                }
                if let Some(args) = tc["function"]["arguments"].as_str().filter(|s| !s.is_empty()) {
                    entry.args.push_str(args);
                    if entry.announced {
                        out.push(Ok(StreamEvent::ToolArgDelta {
                            call_id: entry.id.clone(),
                            json_fragment: args.to_string(),
                        }));
                    }
                }
            }
            return out;
        }

        // Reasoning side channel: `reasoning_content` (llama.cpp, DeepSeek)
        // with `reasoning` (aggregators) as the fallback name.
        let thinking = delta
            .get("reasoning_content")
            .and_then(|c| c.as_str())
            .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()))
            .filter(|s| !s.is_empty());
        if let Some(t) = thinking {
            if !self.thinking_open {
                self.thinking_open = true;
                out.push(Ok(StreamEvent::ThinkingStart));
            }
            self.thinking.push_str(t);
            out.push(Ok(StreamEvent::ThinkingDelta {
                text: t.to_string(),
            }));
            return out;
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                if self.thinking_open {
                    self.thinking_open = false;
                    out.push(Ok(StreamEvent::ThinkingEnd {
                        full_text: std::mem::take(&mut self.thinking),
                    }));
                }
                self.text.push_str(text);
                out.push(Ok(StreamEvent::TextDelta {
                    text: text.to_string(),
                }));
            }
        }
        out
    }

    /// Close the message on the `[DONE]` sentinel: flush an open thinking
    /// block, end every pending tool call, then emit the assembled message.
    fn finish(&mut self) -> Vec<anyhow::Result<StreamEvent>> {
        self.done = true;
        let mut out = Vec::new();
        if self.thinking_open {
            self.thinking_open = false;
            out.push(Ok(StreamEvent::ThinkingEnd {
                full_text: std::mem::take(&mut self.thinking),
            }));
        }

        let mut tool_calls = Vec::new();
        for (i, call) in std::mem::take(&mut self.pending).into_values().enumerate() {
            if call.name.is_empty() {
                // Cannot be dispatched and would corrupt the history sent
                // back on the next turn.
                warn!(call_id = %call.id, "dropping tool call with empty name from stream");
                continue;
            }
            let id = if call.id.is_empty() {
                warn!(tool = %call.name, "tool call had no id; generating synthetic id");
                format!("call_synthetic_{i}")
            } else {
                call.id
            };
            let parsed: Value = serde_json::from_str(&call.args)
                .unwrap_or_else(|_| Value::Object(Default::default()));
            out.push(Ok(StreamEvent::ToolEnd {
                call_id: id.clone(),
                parsed_input: parsed,
            }));
            tool_calls.push(ToolCallRequest {
                id,
                name: call.name,
                arguments: call.args,
            });
        }

        let stop_reason = self.finish_reason.unwrap_or({
            if tool_calls.is_empty() {
                StopReason::EndTurn
            } else {
                StopReason::ToolUse
            }
        });
        let text = std::mem::take(&mut self.text);
        out.push(Ok(StreamEvent::MessageComplete {
            message: Message::Assistant {
                text: if text.is_empty() { None } else { Some(text) },
                tool_calls,
            },
            stop_reason,
        }));
        out
    }
}

fn map_finish_reason(s: &str) -> StopReason {
    match s {
        "stop" => StopReason::EndTurn,
        "tool_calls" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        _ => StopReason::Other,
    }
}

// ─── Wire encoding ────────────────────────────────────────────────────────────

/// Render the canonical log into this dialect.
///
/// An assistant entry with tool calls becomes one wire message carrying a
/// `tool_calls` array (argument strings forwarded verbatim); tool results
/// become `tool` role entries keyed by `tool_call_id`.
pub(crate) fn build_openai_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m {
            Message::System { content } => json!({ "role": "system", "content": content }),
            Message::User { content } => json!({ "role": "user", "content": content }),
            Message::Assistant { text, tool_calls } => {
                if tool_calls.is_empty() {
                    return json!({
                        "role": "assistant",
                        "content": text.clone().unwrap_or_default(),
                    });
                }
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        })
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant", "tool_calls": calls });
                if let Some(t) = text {
                    if !t.is_empty() {
                        msg["content"] = json!(t);
                    }
                }
                msg
            }
            Message::ToolResult { call_id, content } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": content,
            }),
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_ok(a: &mut ChatAssembly, line: &str) -> Vec<StreamEvent> {
        a.feed_line(line).into_iter().map(|r| r.unwrap()).collect()
    }

    fn data(v: Value) -> String {
        format!("data: {v}")
    }

    // ── Stream assembly ───────────────────────────────────────────────────────

    #[test]
    fn plain_text_turn_completes_with_end_turn() {
        let mut a = ChatAssembly::default();
        let evs = feed_ok(&mut a, &data(json!({"choices":[{"delta":{"content":"hello"}}]})));
        assert!(matches!(&evs[0], StreamEvent::TextDelta { text } if text == "hello"));
        feed_ok(&mut a, &data(json!({"choices":[{"delta":{}, "finish_reason":"stop"}]})));
        let evs = feed_ok(&mut a, "data: [DONE]");
        match &evs[0] {
            StreamEvent::MessageComplete { message, stop_reason } => {
                assert_eq!(message.text(), Some("hello"));
                assert_eq!(*stop_reason, StopReason::EndTurn);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_call_deltas_accumulate_by_index() {
        let mut a = ChatAssembly::default();
        let evs = feed_ok(
            &mut a,
            &data(json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call_1","function":{"name":"run_command","arguments":""}}]}}]})),
        );
        assert!(
            matches!(&evs[0], StreamEvent::ToolStart { call_id, name }
                if call_id == "call_1" && name == "run_command")
        );
        feed_ok(
            &mut a,
            &data(json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"arguments":"{\"command\":"}}]}}]})),
        );
        feed_ok(
            &mut a,
            &data(json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"arguments":"\"ls\"}"}}]}}]})),
        );
        feed_ok(&mut a, &data(json!({"choices":[{"delta":{}, "finish_reason":"tool_calls"}]})));
        let evs = feed_ok(&mut a, "data: [DONE]");
        match &evs[0] {
            StreamEvent::ToolEnd { call_id, parsed_input } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(parsed_input["command"], "ls");
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &evs[1] {
            StreamEvent::MessageComplete { message, stop_reason } => {
                assert_eq!(*stop_reason, StopReason::ToolUse);
                let Message::Assistant { tool_calls, .. } = message else {
                    panic!("not assistant")
                };
                assert_eq!(tool_calls[0].arguments, "{\"command\":\"ls\"}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parallel_tool_calls_keep_their_indices_apart() {
        let mut a = ChatAssembly::default();
        feed_ok(
            &mut a,
            &data(json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"c0","function":{"name":"alpha","arguments":"{\"a\":1}"}}]}}]})),
        );
        feed_ok(
            &mut a,
            &data(json!({"choices":[{"delta":{"tool_calls":[
                {"index":1,"id":"c1","function":{"name":"beta","arguments":"{\"b\":2}"}}]}}]})),
        );
        let evs = feed_ok(&mut a, "data: [DONE]");
        let complete = evs.last().unwrap();
        let StreamEvent::MessageComplete { message, .. } = complete else {
            panic!("missing completion")
        };
        let Message::Assistant { tool_calls, .. } = message else {
            panic!("not assistant")
        };
        assert_eq!(tool_calls.len(), 2);
        assert_eq!(tool_calls[0].id, "c0");
        assert_eq!(tool_calls[0].arguments, "{\"a\":1}");
        assert_eq!(tool_calls[1].id, "c1");
        assert_eq!(tool_calls[1].arguments, "{\"b\":2}");
    }

    #[test]
    fn finish_reason_length_maps_to_max_tokens() {
        let mut a = ChatAssembly::default();
        feed_ok(&mut a, &data(json!({"choices":[{"delta":{"content":"the plan is"}}]})));
        feed_ok(&mut a, &data(json!({"choices":[{"delta":{}, "finish_reason":"length"}]})));
        let evs = feed_ok(&mut a, "data: [DONE]");
        assert!(
            matches!(&evs[0], StreamEvent::MessageComplete { stop_reason: StopReason::MaxTokens, .. })
        );
    }

    #[test]
    fn unknown_finish_reason_maps_to_other() {
        let mut a = ChatAssembly::default();
        feed_ok(&mut a, &data(json!({"choices":[{"delta":{}, "finish_reason":"content_filter"}]})));
        let evs = feed_ok(&mut a, "data: [DONE]");
        assert!(
            matches!(&evs[0], StreamEvent::MessageComplete { stop_reason: StopReason::Other, .. })
        );
    }

    #[test]
    fn reasoning_content_rewrites_as_thinking_events() {
        let mut a = ChatAssembly::default();
        let evs = feed_ok(
            &mut a,
            &data(json!({"choices":[{"delta":{"reasoning_content":"step one. "}}]})),
        );
        assert!(matches!(&evs[0], StreamEvent::ThinkingStart));
        assert!(matches!(&evs[1], StreamEvent::ThinkingDelta { text } if text == "step one. "));
        // Thinking closes when answer text begins.
        let evs = feed_ok(&mut a, &data(json!({"choices":[{"delta":{"content":"answer"}}]})));
        assert!(matches!(&evs[0], StreamEvent::ThinkingEnd { full_text } if full_text == "step one. "));
        assert!(matches!(&evs[1], StreamEvent::TextDelta { text } if text == "answer"));
    }

    #[test]
    fn reasoning_fallback_field_is_accepted() {
        let mut a = ChatAssembly::default();
        let evs = feed_ok(&mut a, &data(json!({"choices":[{"delta":{"reasoning":"hmm"}}]})));
        assert!(matches!(&evs[1], StreamEvent::ThinkingDelta { text } if text == "hmm"));
    }

    #[test]
    fn thinking_only_turn_flushes_on_done() {
        let mut a = ChatAssembly::default();
        feed_ok(&mut a, &data(json!({"choices":[{"delta":{"reasoning_content":"all thought"}}]})));
        let evs = feed_ok(&mut a, "data: [DONE]");
        assert!(matches!(&evs[0], StreamEvent::ThinkingEnd { full_text } if full_text == "all thought"));
        assert!(
            matches!(&evs[1], StreamEvent::MessageComplete { message, .. } if message.text().is_none())
        );
    }

    #[test]
    fn sse_line_split_across_chunks_is_reassembled_by_caller_buffer() {
        // The provider task only feeds complete lines; this verifies that a
        // complete line parses while a fragment is a no-op.
        let mut a = ChatAssembly::default();
        let evs = a.feed_line(r#"data: {"choices":[{"delta":{"content":"hel"#);
        assert!(evs.is_empty(), "incomplete JSON must not produce events");
        let evs = feed_ok(&mut a, &data(json!({"choices":[{"delta":{"content":"hello"}}]})));
        assert_eq!(evs.len(), 1);
    }

    #[test]
    fn empty_name_tool_call_is_dropped_and_empty_id_gets_synthetic() {
        let mut a = ChatAssembly::default();
        // No name at all — dropped.
        feed_ok(
            &mut a,
            &data(json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"cx","function":{"arguments":"{}"}}]}}]})),
        );
        // Name but no id — synthetic id assigned.
        feed_ok(
            &mut a,
            &data(json!({"choices":[{"delta":{"tool_calls":[
                {"index":1,"function":{"name":"gamma","arguments":"{}"}}]}}]})),
        );
        let evs = feed_ok(&mut a, "data: [DONE]");
        let StreamEvent::MessageComplete { message, .. } = evs.last().unwrap() else {
            panic!("missing completion")
        };
        let Message::Assistant { tool_calls, .. } = message else {
            panic!("not assistant")
        };
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].name, "gamma");
        assert!(tool_calls[0].id.starts_with("call_synthetic_"));
    }

    #[test]
    fn events_after_done_are_ignored() {
        let mut a = ChatAssembly::default();
        feed_ok(&mut a, "data: [DONE]");
        let evs = feed_ok(&mut a, &data(json!({"choices":[{"delta":{"content":"late"}}]})));
        assert!(evs.is_empty());
    }

    // ── Wire encoding ─────────────────────────────────────────────────────────

    #[test]
    fn system_is_an_in_band_role() {
        let wire = build_openai_messages(&[Message::system("be terse"), Message::user("hi")]);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[0]["content"], "be terse");
        assert_eq!(wire[1]["role"], "user");
    }

    #[test]
    fn assistant_tool_calls_render_as_one_array() {
        let msg = Message::assistant_with_tools(
            Some("checking".into()),
            vec![
                ToolCallRequest {
                    id: "c1".into(),
                    name: "alpha".into(),
                    arguments: r#"{"a":1}"#.into(),
                },
                ToolCallRequest {
                    id: "c2".into(),
                    name: "beta".into(),
                    arguments: r#"{"b":2}"#.into(),
                },
            ],
        );
        let wire = build_openai_messages(&[msg, Message::tool_result("c1", "ok")]);
        assert_eq!(wire.len(), 2);
        let calls = wire[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "c1");
        // Argument strings are forwarded verbatim, not re-parsed.
        assert_eq!(calls[0]["function"]["arguments"], r#"{"a":1}"#);
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "c1");
    }

    #[test]
    fn tool_result_keyed_by_call_id() {
        let wire = build_openai_messages(&[Message::tool_result("abc", "out")]);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "abc");
        assert_eq!(wire[0]["content"], "out");
    }
}
