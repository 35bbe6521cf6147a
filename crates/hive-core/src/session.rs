// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use hive_model::Message;
use uuid::Uuid;

/// Default bound on the conversation log length.
pub const DEFAULT_MAX_LEN: usize = 80;

/// Fraction of `max_len` kept verbatim when the log is compressed.
const KEEP_FRACTION: f32 = 0.6;

/// Ceiling on the running summary, enforced by head-dropping.
const SUMMARY_CAP: usize = 3000;

/// Bounded ordered conversation log with lossy compression into a running
/// text summary.  Owned by exactly one agent worker; never shared.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub log: Vec<Message>,
    pub summary: String,
    pub max_len: usize,
    pub user_turn_count: usize,
}

impl Session {
    pub fn new(max_len: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            log: Vec::new(),
            summary: String::new(),
            max_len,
            user_turn_count: 0,
        }
    }

    /// Append an entry.
    ///
    /// Appending a value identical to the current tail is a no-op, which
    /// guards against double-record bugs in recovery paths.  User entries
    /// bump the turn counter.  Exceeding `max_len` triggers compression.
    pub fn push(&mut self, msg: Message) {
        if self.log.last() == Some(&msg) {
            return;
        }
        if matches!(msg, Message::User { .. }) {
            self.user_turn_count += 1;
        }
        self.log.push(msg);
        if self.log.len() > self.max_len {
            self.compress();
        }
    }

    /// Remove and return the trailing entry (error recovery).
    pub fn pop(&mut self) -> Option<Message> {
        self.log.pop()
    }

    pub fn last(&self) -> Option<&Message> {
        self.log.last()
    }

    /// The view handed to the model: the system entry, then — when a summary
    /// exists — a synthetic user/assistant pair carrying it (preserving the
    /// role alternation some providers require), then the remaining log.
    /// The synthetic pair is never persisted back into the log.
    pub fn messages_for_model(&self) -> Vec<Message> {
        let mut out = Vec::new();
        let mut rest = self.log.as_slice();
        if let Some(first @ Message::System { .. }) = self.log.first() {
            out.push(first.clone());
            rest = &self.log[1..];
        }
        if !self.summary.is_empty() {
            out.push(Message::user(format!(
                "here is the context summary of earlier conversation: {}",
                self.summary
            )));
            out.push(Message::assistant("acknowledged"));
        }
        out.extend_from_slice(rest);
        out
    }

    /// Compress the log: keep the most recent `0.6 × max_len` non-system
    /// entries (never cutting a tool-call/tool-result group apart) and fold
    /// everything older into the running summary.
    pub fn compress(&mut self) {
        if self.log.len() <= self.max_len {
            return;
        }
        let system = match self.log.first() {
            Some(m @ Message::System { .. }) => Some(m.clone()),
            _ => None,
        };
        let body_start = usize::from(system.is_some());
        let body = &self.log[body_start..];

        let keep = (self.max_len as f32 * KEEP_FRACTION) as usize;
        if body.len() <= keep {
            return;
        }
        let mut cut = (body.len() - keep).min(body.len().saturating_sub(1));
        // Expand the retention window until the cut falls on a clean pairing
        // boundary: the first kept entry must never be an orphaned tool
        // result whose assistant anchor was summarised away.
        while cut > 0 && matches!(body[cut], Message::ToolResult { .. }) {
            cut -= 1;
        }
        if cut == 0 {
            return;
        }

        let dropped = &body[..cut];
        let bullets = summarize(dropped);
        if !bullets.is_empty() {
            if !self.summary.is_empty() {
                self.summary.push('\n');
            }
            self.summary.push_str(&bullets);
        }
        if self.summary.len() > SUMMARY_CAP {
            let start = ceil_char_boundary(&self.summary, self.summary.len() - SUMMARY_CAP);
            self.summary = format!("…{}", &self.summary[start..]);
        }

        let kept: Vec<Message> = body[cut..].to_vec();
        self.log.clear();
        if let Some(sys) = system {
            self.log.push(sys);
        }
        self.log.extend(kept);
    }
}

/// One bullet list for a run of dropped entries.
fn summarize(dropped: &[Message]) -> String {
    let mut lines = Vec::new();
    for msg in dropped {
        match msg {
            Message::System { .. } => {}
            Message::User { content } => {
                lines.push(format!("- user: {}", truncate(content, 80)));
            }
            Message::Assistant { text, tool_calls } => {
                if let Some(t) = text {
                    if !t.is_empty() {
                        lines.push(format!("- assistant: {}", truncate(t, 80)));
                    }
                }
                if !tool_calls.is_empty() {
                    let names: Vec<&str> = tool_calls.iter().map(|c| c.name.as_str()).collect();
                    lines.push(format!("- assistant called tool: {}", names.join(", ")));
                }
            }
            Message::ToolResult { content, .. } => {
                lines.push(format!("  - result: {}", truncate(content, 50)));
            }
        }
    }
    lines.join("\n")
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let end = floor_char_boundary(s, limit);
    format!("{}…", &s[..end])
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
