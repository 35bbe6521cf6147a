// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One long-lived child process speaking line-delimited JSON-RPC 2.0.
//!
//! A single reader task consumes the child's stdout; concurrent requests are
//! matched back to their callers through an id → waiter map.  Writes go
//! through a FIFO mutex so interleaved requests never corrupt the framing.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use hive_config::ToolServerSpec;

/// Wire protocol version sent in the `initialize` handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// The whole connection handshake must finish within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period between SIGTERM and SIGKILL on teardown.
const TERM_GRACE: Duration = Duration::from_secs(3);

/// A tool advertised by a connected server.
#[derive(Debug, Clone)]
pub struct ExternalToolDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("external tool timeout")]
    Timeout,
    #[error("{0}")]
    Remote(String),
    #[error("connection closed")]
    Closed,
}

type Waiter = oneshot::Sender<Result<Value, RequestError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Waiter>>>;

pub struct ToolServerConnection {
    name: String,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    next_id: AtomicU64,
    pending: PendingMap,
    tools: Vec<ExternalToolDef>,
}

impl ToolServerConnection {
    /// Spawn the server process and run the connection handshake:
    /// `initialize` → `notifications/initialized` → `tools/list`.
    pub async fn connect(name: &str, spec: &ToolServerSpec) -> anyhow::Result<Self> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning external tool server {name:?}"))?;

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;
        let stdin = child.stdin.take().context("child stdin not piped")?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        spawn_reader(name.to_string(), stdout, Arc::clone(&pending));

        // Server log lines on stderr go to tracing, nowhere near the protocol.
        let log_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %log_name, "stderr: {line}");
            }
        });

        let mut conn = Self {
            name: name.to_string(),
            child: tokio::sync::Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            next_id: AtomicU64::new(1),
            pending,
            tools: Vec::new(),
        };

        let tools = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.handshake())
            .await
            .map_err(|_| anyhow::anyhow!("handshake with {name:?} timed out"))??;
        conn.tools = tools;
        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[ExternalToolDef] {
        &self.tools
    }

    async fn handshake(&self) -> anyhow::Result<Vec<ExternalToolDef>> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "hive", "version": env!("CARGO_PKG_VERSION") },
            }),
            HANDSHAKE_TIMEOUT,
        )
        .await
        .map_err(|e| anyhow::anyhow!("initialize failed: {e}"))?;

        self.notify("notifications/initialized", json!({})).await?;

        let listed = self
            .request("tools/list", json!({}), HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| anyhow::anyhow!("tools/list failed: {e}"))?;
        Ok(parse_tool_list(&listed))
    }

    /// Send one request and wait for the matching response.
    ///
    /// On timeout the waiter is removed from the map so a late response is
    /// discarded instead of resolving a stranger's call.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending map poisoned").insert(id, tx);

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(e) = self.write_line(&frame).await {
            self.pending.lock().expect("pending map poisoned").remove(&id);
            return Err(RequestError::Remote(format!("write failed: {e}")));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => {
                self.pending.lock().expect("pending map poisoned").remove(&id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Fire-and-forget notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write_line(&frame).await
    }

    async fn write_line(&self, frame: &Value) -> anyhow::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().context("connection is closed")?;
        let mut line = frame.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Invoke one tool on this server.  All failure modes degrade to result
    /// strings; the conversation loop never sees an error from here.
    pub async fn call_tool(&self, tool: &str, args: &Value, timeout: Duration) -> String {
        let result = self
            .request(
                "tools/call",
                json!({ "name": tool, "arguments": args }),
                timeout,
            )
            .await;
        match result {
            Ok(value) => render_call_result(&value),
            Err(RequestError::Timeout) => "external tool timeout".into(),
            Err(e) => format!("external tool failed: {e}"),
        }
    }

    /// Close stdin, SIGTERM, grace window, SIGKILL.  All pending requests are
    /// rejected.
    pub async fn disconnect(&self) {
        self.stdin.lock().await.take();

        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(server = %self.name, "did not exit after SIGTERM; killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        reject_all(&self.pending);
    }
}

/// One task per connection owns the child's stdout.
fn spawn_reader(
    server: String,
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => dispatch_line(&server, &line, &pending),
                Ok(None) | Err(_) => break,
            }
        }
        debug!(server = %server, "stdout closed");
        reject_all(&pending);
    });
}

/// Parse one stdout line and resolve the matching waiter, if any.
///
/// Lines that fail to parse are dropped silently — servers that write log
/// lines to stdout must not break the protocol.
fn dispatch_line(server: &str, line: &str, pending: &PendingMap) {
    let Ok(v) = serde_json::from_str::<Value>(line) else {
        debug!(server = %server, "dropping non-JSON line");
        return;
    };
    let Some(id) = v.get("id").and_then(|i| i.as_u64()) else {
        // Server-initiated notification; nothing waits on it.
        return;
    };
    let Some(waiter) = pending.lock().expect("pending map poisoned").remove(&id) else {
        return;
    };
    let outcome = if let Some(error) = v.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        Err(RequestError::Remote(message.to_string()))
    } else {
        Ok(v.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = waiter.send(outcome);
}

fn reject_all(pending: &PendingMap) {
    let waiters: Vec<Waiter> = pending
        .lock()
        .expect("pending map poisoned")
        .drain()
        .map(|(_, w)| w)
        .collect();
    for waiter in waiters {
        let _ = waiter.send(Err(RequestError::Closed));
    }
}

/// Extract tool definitions from a `tools/list` result.
fn parse_tool_list(result: &Value) -> Vec<ExternalToolDef> {
    let Some(tools) = result.get("tools").and_then(|t| t.as_array()) else {
        return Vec::new();
    };
    tools
        .iter()
        .filter_map(|t| {
            let name = t.get("name")?.as_str()?.to_string();
            Some(ExternalToolDef {
                name,
                description: t
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or("")
                    .to_string(),
                parameters: t
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object" })),
            })
        })
        .collect()
}

/// Flatten a `tools/call` result into the single text payload the model
/// accepts: text items joined with newlines, other content types rendered as
/// a placeholder.
fn render_call_result(result: &Value) -> String {
    let Some(content) = result.get("content").and_then(|c| c.as_array()) else {
        return result.to_string();
    };
    content
        .iter()
        .map(|item| match item.get("type").and_then(|t| t.as_str()) {
            Some("text") => item
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_string(),
            Some(other) => format!("[{other} content]"),
            None => "[unknown content]".into(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Pure wire helpers ─────────────────────────────────────────────────────

    #[test]
    fn tool_list_parses_names_descriptions_and_schemas() {
        let result = json!({
            "tools": [
                {"name": "read_file", "description": "Reads a file",
                 "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}},
                {"name": "bare"},
            ]
        });
        let tools = parse_tool_list(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "read_file");
        assert_eq!(tools[0].parameters["properties"]["path"]["type"], "string");
        assert_eq!(tools[1].description, "");
        assert_eq!(tools[1].parameters["type"], "object");
    }

    #[test]
    fn tool_list_without_tools_array_is_empty() {
        assert!(parse_tool_list(&json!({})).is_empty());
    }

    #[test]
    fn call_result_concatenates_text_items() {
        let result = json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "text", "text": "line two"},
            ]
        });
        assert_eq!(render_call_result(&result), "line one\nline two");
    }

    #[test]
    fn call_result_renders_unknown_content_types_as_placeholders() {
        let result = json!({
            "content": [
                {"type": "text", "text": "see attachment"},
                {"type": "image", "data": "AAAA"},
            ]
        });
        assert_eq!(render_call_result(&result), "see attachment\n[image content]");
    }

    #[test]
    fn dispatch_line_resolves_the_matching_waiter_only() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.lock().unwrap().insert(1, tx1);
        pending.lock().unwrap().insert(2, tx2);

        dispatch_line(
            "srv",
            r#"{"jsonrpc":"2.0","id":2,"result":{"ok":true}}"#,
            &pending,
        );
        // Exactly one of resolve/reject fired for id 2; id 1 untouched.
        assert!(rx1.try_recv().is_err());
        let got = rx2.try_recv().unwrap().unwrap();
        assert_eq!(got["ok"], true);
        assert!(pending.lock().unwrap().contains_key(&1));
        assert!(!pending.lock().unwrap().contains_key(&2));
    }

    #[test]
    fn dispatch_line_rejects_on_jsonrpc_error() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);
        dispatch_line(
            "srv",
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":"no such tool"}}"#,
            &pending,
        );
        match rx.try_recv().unwrap() {
            Err(RequestError::Remote(msg)) => assert_eq!(msg, "no such tool"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn non_json_lines_are_dropped_silently() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(1, tx);
        dispatch_line("srv", "starting server on port 1234...", &pending);
        dispatch_line("srv", "", &pending);
        assert!(rx.try_recv().is_err(), "log lines must not resolve waiters");
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        // Must not panic or grow the map.
        dispatch_line("srv", r#"{"jsonrpc":"2.0","id":99,"result":{}}"#, &pending);
        assert!(pending.lock().unwrap().is_empty());
    }

    // ── Live subprocess round trip ────────────────────────────────────────────

    /// A stub server in bash: answers the three handshake requests and one
    /// tools/call by request order.  Request ids are deterministic (1, 2, 3)
    /// because the connection's counter starts at 1.
    const STUB_SERVER: &str = r#"
        read -r _init
        printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}'
        read -r _initialized
        read -r _list
        echo "stub: listing tools" >&2
        printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"greet","description":"greets","inputSchema":{"type":"object"}}]}}'
        read -r _call
        printf 'this is a log line, not JSON\n'
        printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hello from stub"}]}}'
    "#;

    fn stub_spec(script: &str) -> ToolServerSpec {
        ToolServerSpec {
            command: "bash".into(),
            args: vec!["-c".into(), script.into()],
            env: Default::default(),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn handshake_discovers_tools_and_calls_round_trip() {
        let conn = ToolServerConnection::connect("stub", &stub_spec(STUB_SERVER))
            .await
            .unwrap();
        assert_eq!(conn.tools().len(), 1);
        assert_eq!(conn.tools()[0].name, "greet");

        let out = conn
            .call_tool("greet", &json!({}), Duration::from_secs(5))
            .await;
        assert_eq!(out, "hello from stub");
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn handshake_failure_is_an_error_not_a_hang() {
        // A server that exits immediately never answers initialize.
        let spec = stub_spec("exit 0");
        let err = ToolServerConnection::connect("dead", &spec).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn call_timeout_removes_the_waiter() {
        let script = r#"
            read -r _init
            printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{}}'
            read -r _initialized
            read -r _list
            printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}'
            read -r _call
            sleep 30
        "#;
        let conn = ToolServerConnection::connect("slow", &stub_spec(script))
            .await
            .unwrap();
        let out = conn
            .call_tool("anything", &json!({}), Duration::from_millis(200))
            .await;
        assert_eq!(out, "external tool timeout");
        assert!(conn.pending.lock().unwrap().is_empty());
        conn.disconnect().await;
    }
}
