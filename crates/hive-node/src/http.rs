// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::info;

use hive_config::{load_graph, save_graph, GraphSpec};
use hive_runtime::SystemController;

/// GET /api/system — the persisted graph verbatim (empty default).
pub async fn get_system(State(controller): State<Arc<SystemController>>) -> Response {
    let path = controller.workspace().join("system.json");
    match load_graph(&path) {
        Ok(graph) => Json(graph).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}")),
    }
}

/// POST /api/system — persist the new graph and reload atomically.
pub async fn post_system(
    State(controller): State<Arc<SystemController>>,
    Json(graph): Json<GraphSpec>,
) -> Response {
    let path = controller.workspace().join("system.json");
    if let Err(e) = save_graph(&path, &graph) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}"));
    }
    info!(agents = graph.agents.len(), "graph update received");
    match controller.load_or_reload(graph).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}")),
    }
}

/// GET /api/agent/{id}/history — journal plus current session.
pub async fn get_history(
    State(controller): State<Arc<SystemController>>,
    Path(id): Path<String>,
) -> Response {
    match controller.agent_history(&id).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(message) => {
            let status = if message.starts_with("agent not found") {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            error_response(status, &message)
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
