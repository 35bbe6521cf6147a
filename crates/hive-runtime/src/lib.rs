// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod bus;
mod controller;
mod fanout;
pub mod journal;
pub mod scheduler;
mod worker;

pub use bus::{ListAgentsTool, MessageBus, SendMessageTool};
pub use controller::{HistoryMessage, ProviderFactory, SystemController};
pub use fanout::OutboundEvent;
pub use worker::{AgentWorker, TalkOutcome};
