//! Charging display DTOs

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::application::TransactionSnapshot;
use crate::domain::evse::EvseState;

/// Badge presented at the station
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RfidBody {
    /// RFID token identifier
    #[validate(length(min = 1, max = 36, message = "must be 1-36 characters"))]
    #[schema(example = "AA00001")]
    pub rfid: String,
}

/// Live readings of one EVSE, in the field names the display expects
#[derive(Debug, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ChargeStatusDto {
    #[serde(rename = "isEVConnected")]
    pub is_ev_connected: bool,
    #[serde(rename = "isChargingEnabled")]
    pub is_charging_enabled: bool,
    #[serde(rename = "isCharging")]
    pub is_charging: bool,
    #[serde(rename = "isError")]
    pub is_error: bool,
    #[serde(rename = "energyActiveNet_kwh_float")]
    pub energy_active_net_kwh: f64,
    #[serde(rename = "powerActiveImport_kw_float")]
    pub power_active_import_kw: f64,
}

impl From<&EvseState> for ChargeStatusDto {
    fn from(state: &EvseState) -> Self {
        Self {
            is_ev_connected: state.ev_connected,
            is_charging_enabled: state.charging_enabled,
            is_charging: state.charging,
            is_error: state.in_error,
            energy_active_net_kwh: state.energy_active_net_kwh(),
            power_active_import_kw: state.power_active_import_kw(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartedDto {
    pub transaction_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub transaction_id: String,
    pub evse_id: i32,
    /// Created, AwaitingAuthorization, InProgress, AwaitingStopAuthorization, Ending or Ended
    pub phase: String,
    pub next_seq_no: u64,
    pub in_progress: bool,
    pub id_token: String,
    pub started_at: String,
}

impl From<TransactionSnapshot> for TransactionDto {
    fn from(tx: TransactionSnapshot) -> Self {
        Self {
            transaction_id: tx.transaction_id.to_string(),
            evse_id: tx.evse_id,
            phase: tx.phase.as_str().to_string(),
            next_seq_no: tx.next_seq_no,
            in_progress: tx.in_progress,
            id_token: tx.id_token,
            started_at: tx.started_at.to_rfc3339(),
        }
    }
}
