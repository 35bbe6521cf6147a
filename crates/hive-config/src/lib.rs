// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::{load_graph, save_graph, RuntimeConfig};
pub use schema::{
    AgentData, AgentSpec, Connection, CronJob, GraphSpec, ProviderKind, ProviderSettings,
    ToolServerSpec,
};
