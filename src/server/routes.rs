//! Route handlers for the sync server.
//!
//! This module contains the HTTP route handlers and related types for the Axum server.

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::{Json, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;

use crate::server::websocket::handle_websocket_connection;
use crate::sync::SyncEngine;

/// Shared application state
pub type AppState = Arc<SyncEngine>;

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub replicas: usize,
    pub keys: usize,
    pub persistence_failures: u32,
}

/// Health check endpoint, reporting degraded while checkpoints keep failing
pub async fn health(State(engine): State<AppState>) -> Json<HealthResponse> {
    let persistence = engine.persistence();
    let status = if persistence.degraded { "degraded" } else { "ok" };

    Json(HealthResponse {
        status: status.to_string(),
        replicas: engine.replica_count(),
        keys: engine.dictionary().len(),
        persistence_failures: persistence.consecutive_failures,
    })
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(engine): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, engine))
}

/// Creates and configures the main application router
pub fn create_router(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(engine)
}
