//! OCPP 2.0.1 payloads sent by the station, and the response fields it
//! reads back.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_ocpp::v2_0_1::enumerations::authorization_status_enum_type::AuthorizationStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::connector_status_enum_type::ConnectorStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::registration_status_enum_type::RegistrationStatusEnumType;
use rust_ocpp::v2_0_1::messages::authorize::AuthorizeResponse;
use rust_ocpp::v2_0_1::messages::boot_notification::BootNotificationResponse;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::domain::evse::EvseState;
use crate::domain::transaction::{TransactionEvent, TransactionEventType};

pub const BOOT_NOTIFICATION: &str = "BootNotification";
pub const HEARTBEAT: &str = "Heartbeat";
pub const STATUS_NOTIFICATION: &str = "StatusNotification";
pub const AUTHORIZE: &str = "Authorize";
pub const TRANSACTION_EVENT: &str = "TransactionEvent";

/// Every EVSE exposes a single connector.
pub const CONNECTOR_ID: i32 = 1;

/// Token type used for RFID cards presented at the display.
const ID_TOKEN_TYPE: &str = "ISO14443";

/// Identity reported in BootNotification.
#[derive(Debug, Clone)]
pub struct StationIdentity {
    pub station_id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn boot_notification(identity: &StationIdentity) -> Value {
    let mut station = Map::new();
    station.insert("vendorName".into(), json!(identity.vendor));
    station.insert("model".into(), json!(identity.model));
    if let Some(serial) = &identity.serial_number {
        station.insert("serialNumber".into(), json!(serial));
    }
    if let Some(firmware) = &identity.firmware_version {
        station.insert("firmwareVersion".into(), json!(firmware));
    }

    json!({
        "reason": "PowerUp",
        "chargingStation": station,
    })
}

pub fn heartbeat() -> Value {
    json!({})
}

/// Faulted wins over Occupied, Occupied over Available.
pub fn connector_status(state: &EvseState) -> ConnectorStatusEnumType {
    if state.in_error {
        ConnectorStatusEnumType::Faulted
    } else if state.ev_connected {
        ConnectorStatusEnumType::Occupied
    } else {
        ConnectorStatusEnumType::Available
    }
}

pub fn status_notification(state: &EvseState, at: DateTime<Utc>) -> Value {
    json!({
        "timestamp": timestamp(at),
        "connectorStatus": connector_status(state),
        "evseId": state.id,
        "connectorId": CONNECTOR_ID,
    })
}

fn id_token(token: &str) -> Value {
    json!({ "idToken": token, "type": ID_TOKEN_TYPE })
}

pub fn authorize(token: &str) -> Value {
    json!({ "idToken": id_token(token) })
}

pub fn transaction_event(event: &TransactionEvent) -> Value {
    let mut transaction_info = json!({ "transactionId": event.transaction_id.to_string() });
    if event.event_type == TransactionEventType::Ended {
        transaction_info["stoppedReason"] = json!("EVDisconnected");
    }

    let at = timestamp(event.timestamp);
    let mut payload = json!({
        "eventType": event.event_type,
        "timestamp": at,
        "triggerReason": event.trigger_reason,
        "seqNo": event.seq_no,
        "transactionInfo": transaction_info,
        "evse": { "id": event.evse_id, "connectorId": CONNECTOR_ID },
        "meterValue": [{
            "timestamp": at,
            "sampledValue": [
                {
                    "value": event.sample.energy_active_net_wh,
                    "measurand": "Energy.Active.Net",
                    "unitOfMeasure": { "unit": "Wh" },
                },
                {
                    "value": event.sample.power_active_import_w,
                    "measurand": "Power.Active.Import",
                    "unitOfMeasure": { "unit": "W" },
                },
            ],
        }],
    });
    if let Some(token) = &event.id_token {
        payload["idToken"] = id_token(token);
    }
    payload
}

/// Outcome of a BootNotification round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOutcome {
    pub accepted: bool,
    /// `interval` from the response, if positive. Only a heartbeat interval
    /// when `accepted`; otherwise the CSMS means a retry delay.
    pub heartbeat_interval_secs: Option<u64>,
}

pub fn parse_boot_response(payload: Value) -> Result<BootOutcome, serde_json::Error> {
    let response: BootNotificationResponse = serde_json::from_value(payload)?;
    let interval = i64::from(response.interval);
    Ok(BootOutcome {
        accepted: matches!(response.status, RegistrationStatusEnumType::Accepted),
        heartbeat_interval_secs: u64::try_from(interval).ok().filter(|secs| *secs > 0),
    })
}

/// Whether an Authorize response grants the token. Unreadable responses
/// count as rejections.
pub fn authorization_accepted(payload: Value) -> bool {
    match serde_json::from_value::<AuthorizeResponse>(payload) {
        Ok(response) => matches!(
            response.id_token_info.status,
            AuthorizationStatusEnumType::Accepted
        ),
        Err(e) => {
            warn!(error = %e, "Unreadable Authorize response, treating as rejected");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;
    use crate::domain::transaction::{MeterSample, TriggerReason};

    fn event(event_type: TransactionEventType, trigger: TriggerReason) -> TransactionEvent {
        TransactionEvent {
            transaction_id: Uuid::nil(),
            evse_id: 2,
            seq_no: 3,
            event_type,
            trigger_reason: trigger,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            sample: MeterSample {
                energy_active_net_wh: 1250,
                power_active_import_w: 7200,
            },
            id_token: None,
        }
    }

    #[test]
    fn boot_notification_omits_unset_fields() {
        let payload = boot_notification(&StationIdentity {
            station_id: "CS001".into(),
            vendor: "WattsUp".into(),
            model: "super-charger-6000".into(),
            serial_number: None,
            firmware_version: Some("1.2.0".into()),
        });
        assert_eq!(payload["reason"], "PowerUp");
        assert_eq!(payload["chargingStation"]["vendorName"], "WattsUp");
        assert_eq!(payload["chargingStation"]["firmwareVersion"], "1.2.0");
        assert!(payload["chargingStation"].get("serialNumber").is_none());
    }

    #[test]
    fn connector_status_precedence() {
        let mut state = EvseState::new(1);
        assert_eq!(status_notification(&state, Utc::now())["connectorStatus"], "Available");
        state.ev_connected = true;
        assert_eq!(status_notification(&state, Utc::now())["connectorStatus"], "Occupied");
        state.in_error = true;
        assert_eq!(status_notification(&state, Utc::now())["connectorStatus"], "Faulted");
    }

    #[test]
    fn transaction_event_payload_shape() {
        let mut authorized = event(TransactionEventType::Updated, TriggerReason::Authorized);
        authorized.id_token = Some("AA00001".into());
        let payload = transaction_event(&authorized);

        assert_eq!(payload["eventType"], "Updated");
        assert_eq!(payload["triggerReason"], "Authorized");
        assert_eq!(payload["seqNo"], 3);
        assert_eq!(payload["timestamp"], "2024-05-01T12:00:00.000Z");
        assert_eq!(payload["evse"], json!({ "id": 2, "connectorId": 1 }));
        assert_eq!(payload["idToken"], json!({ "idToken": "AA00001", "type": "ISO14443" }));
        assert!(payload["transactionInfo"].get("stoppedReason").is_none());

        let sampled = &payload["meterValue"][0]["sampledValue"];
        assert_eq!(sampled[0]["measurand"], "Energy.Active.Net");
        assert_eq!(sampled[0]["value"], 1250);
        assert_eq!(sampled[1]["unitOfMeasure"]["unit"], "W");
    }

    #[test]
    fn ended_event_carries_stopped_reason() {
        let payload = transaction_event(&event(
            TransactionEventType::Ended,
            TriggerReason::EvCommunicationLost,
        ));
        assert_eq!(payload["eventType"], "Ended");
        assert_eq!(payload["triggerReason"], "EVCommunicationLost");
        assert_eq!(payload["transactionInfo"]["stoppedReason"], "EVDisconnected");
        assert!(payload.get("idToken").is_none());
    }

    #[test]
    fn reads_boot_response() {
        let outcome = parse_boot_response(json!({
            "currentTime": "2024-05-01T12:00:00Z",
            "interval": 30,
            "status": "Accepted"
        }))
        .unwrap();
        assert_eq!(
            outcome,
            BootOutcome {
                accepted: true,
                heartbeat_interval_secs: Some(30)
            }
        );

        let pending = parse_boot_response(json!({
            "currentTime": "2024-05-01T12:00:00Z",
            "interval": 0,
            "status": "Pending"
        }))
        .unwrap();
        assert!(!pending.accepted);
        assert_eq!(pending.heartbeat_interval_secs, None);
    }

    #[test]
    fn reads_authorization_status() {
        assert!(authorization_accepted(json!({ "idTokenInfo": { "status": "Accepted" } })));
        assert!(!authorization_accepted(json!({ "idTokenInfo": { "status": "Blocked" } })));
        assert!(!authorization_accepted(json!({ "unexpected": true })));
    }
}
