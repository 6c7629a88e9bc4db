//! Health check endpoint

use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{state::AppState, ApiResult};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub peer_id: String,
    pub peers: usize,
    pub keyshare: bool,
    pub timestamp: chrono::DateTime<Utc>,
    pub version: String,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let health = state.signer.health().await;
    Ok(Json(HealthResponse {
        status: health.status.to_string(),
        peer_id: health.peer_id,
        peers: health.peers,
        keyshare: health.keyshare,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
