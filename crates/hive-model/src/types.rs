// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// A single entry in an agent's conversation log.
///
/// Tool-call arguments are kept as the raw JSON text the model streamed, so a
/// partially streamed or malformed argument string survives a round-trip
/// through the session log and back out to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        call_id: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tools(text: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self::Assistant { text, tool_calls }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    /// Plain text of this entry, if it carries any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::System { content } | Self::User { content } => Some(content),
            Self::Assistant { text, .. } => text.as_deref(),
            Self::ToolResult { .. } => None,
        }
    }

    pub fn is_assistant_with_tools(&self) -> bool {
        matches!(self, Self::Assistant { tool_calls, .. } if !tool_calls.is_empty())
    }
}

/// One tool invocation requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Stable call id assigned by the provider; tool results answer it.
    pub id: String,
    pub name: String,
    /// Raw JSON argument text as streamed by the model.
    pub arguments: String,
}

impl ToolCallRequest {
    /// Parse the argument text; malformed JSON degrades to an empty object.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        serde_json::from_str(&self.arguments)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

/// Why the model stopped emitting, normalised across dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other,
}

impl StopReason {
    /// Natural stops finished on the model's own terms; anything else is
    /// truncation from the engine's point of view.
    pub fn is_natural(self) -> bool {
        matches!(self, Self::EndTurn | Self::ToolUse | Self::StopSequence)
    }
}

/// One event in the unified provider stream.
///
/// Both dialects are normalised into this protocol; the conversation engine
/// never sees wire-level detail.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    ThinkingStart,
    ThinkingDelta {
        text: String,
    },
    ThinkingEnd {
        full_text: String,
    },
    TextDelta {
        text: String,
    },
    ToolStart {
        call_id: String,
        name: String,
    },
    ToolArgDelta {
        call_id: String,
        json_fragment: String,
    },
    ToolEnd {
        call_id: String,
        parsed_input: serde_json::Value,
    },
    /// The stream finished; carries the fully assembled assistant message.
    MessageComplete {
        message: Message,
        stop_reason: StopReason,
    },
}

/// A tool schema offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: serde_json::Value,
}

/// Request handed to a provider's `stream`.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: Option<u32>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
