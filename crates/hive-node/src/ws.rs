// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket bridge: JSON client commands in, the broadcast event stream out.
//!
//! The fan-out is lossy to slow clients by design: a subscriber that lags the
//! broadcast channel loses the skipped events and is told so.  Conversation
//! state stays recoverable through the history endpoint.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use hive_runtime::{OutboundEvent, SystemController};

/// Client-to-server commands.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Message {
        content: String,
        #[serde(default)]
        target_agent_id: Option<String>,
    },
    Interrupt {
        #[serde(default)]
        target_agent_id: Option<String>,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(controller): State<Arc<SystemController>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, controller))
}

async fn handle_socket(mut socket: WebSocket, controller: Arc<SystemController>) {
    info!("UI client connected");
    let mut events = controller.subscribe();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(cmd) => {
                                log_command(&cmd);
                                if let Err(message) = run_command(&controller, cmd).await {
                                    send_event(&mut socket, &OutboundEvent::Error { message }).await;
                                }
                            }
                            Err(e) => {
                                warn!("invalid command JSON: {e}");
                                let err = OutboundEvent::Error {
                                    message: format!("invalid command: {e}"),
                                };
                                send_event(&mut socket, &err).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!("WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            result = events.recv() => {
                match result {
                    Ok(ev) => send_event(&mut socket, &ev).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("UI client lagged by {n} events");
                        let err = OutboundEvent::Error {
                            message: format!("event stream lagged by {n} events"),
                        };
                        send_event(&mut socket, &err).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("UI client disconnected");
}

async fn run_command(
    controller: &Arc<SystemController>,
    cmd: ClientCommand,
) -> Result<(), String> {
    match cmd {
        ClientCommand::Message {
            content,
            target_agent_id,
        } => controller.handle_user_message(content, target_agent_id).await,
        ClientCommand::Interrupt { target_agent_id } => {
            controller.interrupt(target_agent_id).await
        }
    }
}

/// Input text is previewed, never logged in full.
fn log_command(cmd: &ClientCommand) {
    match cmd {
        ClientCommand::Message {
            content,
            target_agent_id,
        } => {
            let preview: String = content.chars().take(80).collect();
            let truncated = if content.len() > 80 { "…" } else { "" };
            info!(target = ?target_agent_id, input = %format!("{preview}{truncated}"), "user message");
        }
        ClientCommand::Interrupt { target_agent_id } => {
            info!(target = ?target_agent_id, "interrupt requested");
        }
    }
}

async fn send_event(socket: &mut WebSocket, ev: &OutboundEvent) {
    if let Ok(json) = serde_json::to_string(ev) {
        let _ = socket.send(Message::Text(json)).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_command_parses_with_and_without_target() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type": "message", "content": "hi"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Message { content, target_agent_id }
            if content == "hi" && target_agent_id.is_none()));

        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type": "message", "content": "hi", "target_agent_id": "a"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ClientCommand::Message { target_agent_id: Some(id), .. }
            if id == "a"));
    }

    #[test]
    fn interrupt_command_parses() {
        let cmd: ClientCommand = serde_json::from_str(r#"{"type": "interrupt"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Interrupt { target_agent_id: None }));
    }

    #[test]
    fn unknown_command_type_is_rejected() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type": "reboot"}"#).is_err());
    }
}
