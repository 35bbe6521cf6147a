// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod connection;
mod manager;

pub use connection::{ExternalToolDef, RequestError, ToolServerConnection};
pub use manager::{exposed_name, ExternalToolManager};
