// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The outward event protocol: one tagged enum broadcast to every subscribed
//! UI client.  Slow clients may lag and lose events; conversation state stays
//! recoverable from the journal.

use serde::{Deserialize, Serialize};

/// Server-to-client events.  Every variant carries the emitting agent's id
/// except `error` and `system_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    ThinkingStart {
        agent_id: String,
    },
    ThinkingDelta {
        agent_id: String,
        text: String,
    },
    ThinkingEnd {
        agent_id: String,
        full_text: String,
    },
    ThinkingHidden {
        agent_id: String,
        length: usize,
    },
    MessageDelta {
        agent_id: String,
        text: String,
    },
    MessageEnd {
        agent_id: String,
        full_text: String,
        truncated: bool,
    },
    ToolStart {
        agent_id: String,
        name: String,
    },
    ToolEnd {
        agent_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolExec {
        agent_id: String,
        name: String,
    },
    ToolResult {
        agent_id: String,
    },
    Error {
        message: String,
    },
    SystemMessage {
        message: String,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
