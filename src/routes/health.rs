use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_jobs: usize,
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let active_jobs = state.active_jobs().await;
    Json(HealthResponse {
        status: health_status(active_jobs),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_jobs,
    })
}

/// Pure status derivation so it stays trivially testable.
fn health_status(active_jobs: usize) -> String {
    if active_jobs > 0 { "busy" } else { "idle" }.to_string()
}

// ============================================================================
// Tests
// ============================================================================
