use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::SecondsFormat;
use chrono::Utc;
use stingbot_protocol::HealthResponse;
use stingbot_protocol::StatusResponse;

use crate::state::AppState;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        gateway: "online".to_string(),
        connections: state.registry.connection_count(),
        uptime: state.started_at.elapsed().as_secs(),
        active_missions: state.registry.active_missions(),
    })
}
