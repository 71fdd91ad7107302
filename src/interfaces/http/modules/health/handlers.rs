//! Health check handler

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::application::ChargingStation;

#[derive(Clone)]
pub struct HealthState {
    pub station: ChargingStation,
    pub started_at: Arc<Instant>,
}

/// Station health response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub station_id: String,
    pub uptime_seconds: u64,
    pub csms: CsmsLinkHealth,
    pub evse_count: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CsmsLinkHealth {
    pub connected: bool,
    /// Calls sent and still waiting for a result.
    pub pending_calls: usize,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "CSMS link is up", body = HealthResponse),
        (status = 503, description = "CSMS link is down", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let transport = state.station.transport();
    let connected = transport.is_connected();

    let (http_status, status) = if connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        http_status,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            station_id: state.station.identity().station_id.clone(),
            uptime_seconds: state.started_at.elapsed().as_secs(),
            csms: CsmsLinkHealth {
                connected,
                pending_calls: transport.pending_count(),
            },
            evse_count: state.station.list_active_evse_ids().len(),
        }),
    )
}
