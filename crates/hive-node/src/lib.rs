// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod http;
mod ws;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use hive_runtime::SystemController;

pub use ws::ClientCommand;

pub fn router(controller: Arc<SystemController>) -> Router {
    Router::new()
        .route("/api/system", get(http::get_system).post(http::post_system))
        .route("/api/agent/:id/history", get(http::get_history))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(controller)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    controller: Arc<SystemController>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let port = controller.port();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;
    Ok(())
}

// Dummy route-shape check; the handlers are exercised through the runtime
// crate's controller tests.
#[cfg(test)]
mod tests {
    use super::*;
    use hive_config::{ProviderKind, RuntimeConfig};

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SystemController::new(RuntimeConfig {
            provider: ProviderKind::Mock,
            model: "mock-model".into(),
            base_url: None,
            api_key: None,
            workspace: dir.path().to_path_buf(),
            port: 0,
        });
        let _router = router(controller);
    }
}
