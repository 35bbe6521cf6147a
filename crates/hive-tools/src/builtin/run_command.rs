// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::safety;
use crate::tool::{Tool, ToolContext};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 8 * 1024;

/// Built-in tool that runs a shell command with a bounded wall clock.
pub struct RunCommandTool {
    pub timeout_secs: u64,
}

impl Default for RunCommandTool {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'command' is required and can be any bash one-liner.\n\
         Output is capped at 8 KB; when larger, the head and tail are kept\n\
         with an omission marker in the middle.\n\
         Prefer non-interactive commands; avoid anything that needs a TTY."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional, default 10)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
            return Ok("run_command requires a 'command' string argument".into());
        };

        if let Some(pattern) = safety::blocked_pattern(command) {
            return Ok(format!(
                "⚠ blocked by safety policy: command matches denied pattern {pattern:?}"
            ));
        }

        let timeout = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, timeout, "executing run_command");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        // No controlling terminal for the child: stdin points at /dev/null so
        // isatty(0) is false, and setsid() detaches the process group so a
        // timeout kill reaches the whole tree.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(format!("spawn error: {e}")),
            Err(_) => return Ok(format!("command timed out after {timeout}s")),
        };

        let mut content = String::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            content.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&stderr);
        }
        let code = output.status.code().unwrap_or(-1);
        if content.is_empty() {
            content = format!("[exit {code}]");
        } else if code != 0 {
            content = format!("[exit {code}]\n{content}");
        }
        Ok(truncate_output(&content))
    }
}

/// Cap `s` at [`OUTPUT_LIMIT_BYTES`], keeping the head and tail with an
/// omission marker between them so errors at the end of long output survive.
fn truncate_output(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }
    let half = OUTPUT_LIMIT_BYTES / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = ceil_char_boundary(s, s.len() - half);
    let omitted = tail_start - head_end;
    format!(
        "{}\n...[{omitted} bytes omitted]...\n{}",
        &s[..head_end],
        &s[tail_start..]
    )
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
