// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// hive — a multi-agent orchestration server.
///
/// Loads a declarative agent graph, runs one conversation worker per agent,
/// and exposes the system over HTTP + WebSocket.
#[derive(Parser, Debug)]
#[command(name = "hive", version, about)]
pub struct Cli {
    /// Workspace root (graph, journals, memory).  Overrides HIVE_WORKSPACE.
    #[arg(long, short = 'w')]
    pub workspace: Option<PathBuf>,

    /// Listen port.  Overrides HIVE_PORT.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the persisted graph and print any problems, without serving.
    Check {
        /// Path to a graph file (defaults to <workspace>/system.json).
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,
    },
}
