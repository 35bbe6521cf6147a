// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only markdown journal and long-term memory files, one tree per
//! agent.  Deliberately simple: plain files, plain appends.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{Local, NaiveDate};

/// One recorded exchange line.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub role: String,
    pub content: String,
}

fn day_path(workspace: &Path, agent_id: &str, date: NaiveDate) -> PathBuf {
    workspace
        .join("journal")
        .join(agent_id)
        .join(format!("{}.md", date.format("%Y-%m-%d")))
}

/// Append one entry to today's journal for `agent_id`.
pub fn append(workspace: &Path, agent_id: &str, role: &str, content: &str) -> anyhow::Result<()> {
    let path = day_path(workspace, agent_id, Local::now().date_naive());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let timestamp = Local::now().format("%H:%M:%S");
    writeln!(file, "## {role} {timestamp}\n\n{content}\n")?;
    Ok(())
}

/// Full text of one day's journal; empty string when no file exists.
pub fn read_day(workspace: &Path, agent_id: &str, date: NaiveDate) -> String {
    std::fs::read_to_string(day_path(workspace, agent_id, date)).unwrap_or_default()
}

/// Parse a day's journal back into entries (for the history endpoint).
pub fn entries_for_day(workspace: &Path, agent_id: &str, date: NaiveDate) -> Vec<JournalEntry> {
    let text = read_day(workspace, agent_id, date);
    let mut entries = Vec::new();
    let mut current: Option<JournalEntry> = None;
    for line in text.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            let role = header.split_whitespace().next().unwrap_or("").to_string();
            current = Some(JournalEntry {
                role,
                content: String::new(),
            });
        } else if let Some(entry) = current.as_mut() {
            if !line.is_empty() || !entry.content.is_empty() {
                if !entry.content.is_empty() {
                    entry.content.push('\n');
                }
                entry.content.push_str(line);
            }
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    for entry in &mut entries {
        entry.content = entry.content.trim_end().to_string();
    }
    entries
}

/// Append a dated block to an agent's long-term memory file.
pub fn append_memory(workspace: &Path, agent_id: &str, content: &str) -> anyhow::Result<()> {
    let path = workspace.join("memory").join(format!("{agent_id}.md"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let date = Local::now().format("%Y-%m-%d");
    writeln!(file, "## {date}\n\n{content}\n")?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_today() {
        let dir = tempfile::tempdir().unwrap();
        append(dir.path(), "a", "user", "hello there").unwrap();
        let text = read_day(dir.path(), "a", Local::now().date_naive());
        assert!(text.contains("## user"));
        assert!(text.contains("hello there"));
    }

    #[test]
    fn read_missing_day_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_day(dir.path(), "a", Local::now().date_naive()), "");
    }

    #[test]
    fn entries_round_trip_roles_and_content() {
        let dir = tempfile::tempdir().unwrap();
        append(dir.path(), "a", "user", "first question").unwrap();
        append(dir.path(), "a", "assistant", "first answer\nwith two lines").unwrap();
        let entries = entries_for_day(dir.path(), "a", Local::now().date_naive());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, "user");
        assert_eq!(entries[0].content, "first question");
        assert_eq!(entries[1].role, "assistant");
        assert!(entries[1].content.contains("with two lines"));
    }

    #[test]
    fn agents_do_not_share_journals() {
        let dir = tempfile::tempdir().unwrap();
        append(dir.path(), "a", "user", "for a").unwrap();
        append(dir.path(), "b", "user", "for b").unwrap();
        let a = read_day(dir.path(), "a", Local::now().date_naive());
        assert!(a.contains("for a"));
        assert!(!a.contains("for b"));
    }

    #[test]
    fn memory_appends_dated_blocks() {
        let dir = tempfile::tempdir().unwrap();
        append_memory(dir.path(), "a", "learned something").unwrap();
        append_memory(dir.path(), "a", "learned more").unwrap();
        let text = std::fs::read_to_string(dir.path().join("memory/a.md")).unwrap();
        assert!(text.contains("learned something"));
        assert!(text.contains("learned more"));
    }
}
