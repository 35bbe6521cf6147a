// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

/// Events emitted by the conversation engine during one turn.
///
/// One tagged enum delivered over a channel; the worker pattern-matches once
/// to adapt it to the outward wire protocol.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ThinkingStart,
    ThinkingDelta { text: String },
    ThinkingEnd { full_text: String },
    /// A thinking block arrived wholesale, without streamed deltas.
    ThinkingHidden { length: usize },
    TextDelta { text: String },
    /// Text for this iteration finished but the turn continues (tool calls
    /// follow).
    TextPartComplete,
    /// The turn is over.  `truncated` is set for any non-natural stop.
    TextComplete { truncated: bool },
    /// The model requested a tool call.
    ToolStart { name: String },
    /// The call's streamed arguments are complete.
    ToolEnd { name: String, parsed_input: Value },
    /// The tool is about to execute.
    ToolExec { name: String },
    /// A tool result was recorded.
    ToolResult,
    /// A recoverable fault; the turn degrades but continues.
    Error { message: String },
}
