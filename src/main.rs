// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use hive_config::RuntimeConfig;
use hive_runtime::SystemController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut runtime = RuntimeConfig::from_env().context("reading environment configuration")?;
    if let Some(workspace) = cli.workspace {
        runtime.workspace = workspace;
    }
    if let Some(port) = cli.port {
        runtime.port = port;
    }

    if let Some(Commands::Check { file }) = cli.command {
        let path = file.unwrap_or_else(|| runtime.graph_path());
        let graph = hive_config::load_graph(&path)?;
        let problems = graph.validate();
        if problems.is_empty() {
            println!(
                "ok: {} agents, {} connections, {} external tool servers",
                graph.agents.len(),
                graph.connections.len(),
                graph.external_tool_servers.len()
            );
            return Ok(());
        }
        for problem in &problems {
            eprintln!("problem: {problem}");
        }
        anyhow::bail!("{} problem(s) found", problems.len());
    }

    let graph = hive_config::load_graph(&runtime.graph_path())
        .context("loading the persisted graph")?;
    info!(
        workspace = %runtime.workspace.display(),
        agents = graph.agents.len(),
        "starting hive"
    );

    let controller = SystemController::new(runtime);
    controller
        .load_or_reload(graph)
        .await
        .context("initial graph load")?;

    let shutdown_controller = controller.clone();
    let serve_result = hive_node::serve(controller.clone(), async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("SIGINT received; shutting down"),
            Err(e) => warn!("signal handler failed: {e}"),
        }
        shutdown_controller.shutdown().await;
    })
    .await;

    serve_result
}

fn init_logging(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
