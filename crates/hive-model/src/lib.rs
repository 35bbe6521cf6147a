// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod anthropic;
mod mock;
mod openai;
mod provider;
mod types;

use std::sync::Arc;

pub use anthropic::AnthropicProvider;
pub use mock::{EchoProvider, Script, ScriptedProvider};
pub use openai::OpenAiProvider;
pub use provider::{AuthError, EventStream, ModelProvider};
pub use types::*;

use hive_config::{ProviderKind, ProviderSettings};

/// Construct a shared [`ModelProvider`] from resolved per-agent settings.
pub fn from_config(settings: &ProviderSettings) -> Arc<dyn ModelProvider> {
    match settings.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
            settings.model.clone(),
            settings.api_key.clone(),
            settings.base_url.clone(),
            settings.max_tokens,
        )),
        ProviderKind::Openai => Arc::new(OpenAiProvider::new(
            settings.model.clone(),
            settings.api_key.clone(),
            settings.base_url.clone(),
            settings.max_tokens,
        )),
        ProviderKind::Mock => Arc::new(EchoProvider),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(kind: ProviderKind) -> ProviderSettings {
        ProviderSettings {
            kind,
            model: "m".into(),
            base_url: None,
            api_key: Some("k".into()),
            max_tokens: None,
        }
    }

    #[test]
    fn from_config_selects_the_dialect() {
        assert_eq!(from_config(&settings(ProviderKind::Anthropic)).name(), "anthropic");
        assert_eq!(from_config(&settings(ProviderKind::Openai)).name(), "openai");
        assert_eq!(from_config(&settings(ProviderKind::Mock)).name(), "mock");
    }
}
