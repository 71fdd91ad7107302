//! Operator display handlers
//!
//! The display polls `/chargestatus/{evse_id}` and posts badge swipes to
//! `/start` and `/stop`. Command handlers return once the request has been
//! handed to the station, not when the CSMS has answered.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};

use super::dto::{ChargeStatusDto, RfidBody, StartedDto, TransactionDto};
use crate::application::ChargingStation;
use crate::interfaces::http::common::{ApiResponse, ValidatedJson};
use crate::support::errors::StationError;

pub const ILLEGAL_EVSE_ID: &str = "Received illegal value for EVSE Id!";

#[derive(Clone)]
pub struct ChargingState {
    pub station: ChargingStation,
}

/// Failure of a display request.
#[derive(Debug)]
pub enum DisplayError {
    /// The path segment is not an integer.
    IllegalEvseId,
    Station(StationError),
}

impl From<StationError> for DisplayError {
    fn from(e: StationError) -> Self {
        Self::Station(e)
    }
}

impl IntoResponse for DisplayError {
    fn into_response(self) -> Response {
        let e = match self {
            Self::IllegalEvseId => {
                return (StatusCode::BAD_REQUEST, ILLEGAL_EVSE_ID).into_response();
            }
            Self::Station(e) => e,
        };

        let status = match &e {
            StationError::UnknownEvse(_) => StatusCode::NOT_FOUND,
            StationError::TransactionActive(_)
            | StationError::NoActiveTransaction(_)
            | StationError::InvalidPhase { .. } => StatusCode::CONFLICT,
            StationError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            StationError::ControllerStopped => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ApiResponse::<()>::error(e.to_string()))).into_response()
    }
}

/// Badge id as it may appear in logs: everything but the last four
/// characters is replaced by `*`.
fn masked(rfid: &str) -> String {
    let count = rfid.chars().count();
    rfid.chars()
        .enumerate()
        .map(|(i, c)| if i + 4 < count { '*' } else { c })
        .collect()
}

fn parse_evse_id(raw: &str) -> Result<i32, DisplayError> {
    raw.trim().parse().map_err(|_| {
        warn!(evse_id = raw, "Illegal EVSE id from display");
        DisplayError::IllegalEvseId
    })
}

#[utoipa::path(
    post,
    path = "/start/{evse_id}",
    tag = "Charging",
    params(("evse_id" = String, Path, description = "EVSE id")),
    request_body = RfidBody,
    responses(
        (status = 200, description = "Start dispatched", body = ApiResponse<StartedDto>),
        (status = 400, description = "Illegal EVSE id"),
        (status = 404, description = "Unknown EVSE", body = ApiResponse<String>),
        (status = 409, description = "EVSE already has a transaction", body = ApiResponse<String>),
        (status = 422, description = "Invalid RFID", body = ApiResponse<String>)
    )
)]
pub async fn start_charging(
    State(state): State<ChargingState>,
    Path(evse_id): Path<String>,
    ValidatedJson(body): ValidatedJson<RfidBody>,
) -> Result<Json<ApiResponse<StartedDto>>, DisplayError> {
    let evse_id = parse_evse_id(&evse_id)?;
    info!(evse_id, rfid = %masked(&body.rfid), "🔌 Start requested");

    let transaction_id = state.station.start_charging(evse_id, body.rfid).await?;
    Ok(Json(ApiResponse::success(StartedDto {
        transaction_id: transaction_id.to_string(),
    })))
}

#[utoipa::path(
    post,
    path = "/stop/{evse_id}",
    tag = "Charging",
    params(("evse_id" = String, Path, description = "EVSE id")),
    request_body = RfidBody,
    responses(
        (status = 200, description = "Stop dispatched", body = ApiResponse<String>),
        (status = 400, description = "Illegal EVSE id"),
        (status = 404, description = "Unknown EVSE", body = ApiResponse<String>),
        (status = 409, description = "No transaction that can be stopped", body = ApiResponse<String>)
    )
)]
pub async fn stop_charging(
    State(state): State<ChargingState>,
    Path(evse_id): Path<String>,
    ValidatedJson(body): ValidatedJson<RfidBody>,
) -> Result<Json<ApiResponse<String>>, DisplayError> {
    let evse_id = parse_evse_id(&evse_id)?;
    info!(evse_id, rfid = %masked(&body.rfid), "🛑 Stop requested");

    state.station.stop_charging(evse_id, body.rfid).await?;
    Ok(Json(ApiResponse::success("Stop requested".to_string())))
}

#[utoipa::path(
    get,
    path = "/chargestatus/{evse_id}",
    tag = "Charging",
    params(("evse_id" = String, Path, description = "EVSE id")),
    responses(
        (status = 200, description = "Latest EVSE readings", body = ChargeStatusDto),
        (status = 400, description = "Illegal EVSE id"),
        (status = 404, description = "Unknown EVSE", body = ApiResponse<String>)
    )
)]
pub async fn charge_status(
    State(state): State<ChargingState>,
    Path(evse_id): Path<String>,
) -> Result<Json<ChargeStatusDto>, DisplayError> {
    let evse_id = parse_evse_id(&evse_id)?;
    let readings = state.station.charge_status(evse_id)?;
    Ok(Json(ChargeStatusDto::from(&readings)))
}

#[utoipa::path(
    get,
    path = "/evses/active/ids",
    tag = "Charging",
    responses(
        (status = 200, description = "Ids of all managed EVSEs, ascending", body = Vec<i32>)
    )
)]
pub async fn active_evse_ids(State(state): State<ChargingState>) -> Json<Vec<i32>> {
    Json(state.station.list_active_evse_ids())
}

#[utoipa::path(
    get,
    path = "/transaction/{evse_id}",
    tag = "Charging",
    params(("evse_id" = String, Path, description = "EVSE id")),
    responses(
        (status = 200, description = "Latest transaction on the EVSE, if any", body = ApiResponse<TransactionDto>),
        (status = 400, description = "Illegal EVSE id"),
        (status = 404, description = "Unknown EVSE", body = ApiResponse<String>)
    )
)]
pub async fn current_transaction(
    State(state): State<ChargingState>,
    Path(evse_id): Path<String>,
) -> Result<Json<ApiResponse<Option<TransactionDto>>>, DisplayError> {
    let evse_id = parse_evse_id(&evse_id)?;
    let snapshot = state.station.transaction(evse_id).await?;
    Ok(Json(ApiResponse::success(snapshot.map(TransactionDto::from))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_rfid_keeps_only_last_four_characters() {
        assert_eq!(masked("AA00001"), "***0001");
        assert_eq!(masked("04A2B3C4D5E6F7"), "**********E6F7");
        assert!(!masked("AA00001").contains("AA0"));
    }

    #[test]
    fn short_rfid_is_not_padded() {
        assert_eq!(masked("0001"), "0001");
        assert_eq!(masked("01"), "01");
    }
}
