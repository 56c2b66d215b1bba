//! Service-level handlers

use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

/// HEAD / - Health check
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /health - Liveness with a little engine state
pub async fn health_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = &state.engine;
    Json(serde_json::json!({
        "status": "ok",
        "default_provider": engine.keys().default_alias(),
        "providers": engine.keys().providers().aliases(),
        "uploads_in_progress": engine.registry().len(),
        "persistent_backend": engine.backend().is_persistent(),
    }))
}
