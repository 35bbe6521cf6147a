// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::{CompletionRequest, Message, StreamEvent};

/// Finite, non-restartable stream of normalised provider events.
pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Authentication failure.  Unlike transport faults, which the engine
/// recovers from with a tool-free fallback pass, a rejected credential is
/// fatal and propagates to the caller.
#[derive(Debug, thiserror::Error)]
#[error("authentication failed: {0}")]
pub struct AuthError(pub String);

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display and logging.
    fn name(&self) -> &str;

    /// Model identifier forwarded to the API.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the normalised event stream.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream>;

    /// One tool-free request drained into a plain string.
    ///
    /// Used by the reflection scheduler, which needs a synchronous answer
    /// outside any agent's conversation session.
    async fn complete_text(&self, system: &str, prompt: &str) -> anyhow::Result<String> {
        let req = CompletionRequest {
            messages: vec![Message::system(system), Message::user(prompt)],
            tools: Vec::new(),
            max_tokens: None,
        };
        let mut stream = self.stream(req).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta { text: delta } => text.push_str(&delta),
                StreamEvent::MessageComplete { message, .. } => {
                    if text.is_empty() {
                        if let Some(t) = message.text() {
                            text.push_str(t);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(text)
    }
}
