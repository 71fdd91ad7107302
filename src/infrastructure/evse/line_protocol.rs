//! EVSE controller line protocol
//!
//! Commands are single newline-terminated words. Replies are
//! `<header>: <comma separated fields>`:
//!
//! ```text
//! → status?
//! ← status: 1,0,0,0          ev_connected, charging_enabled, charging, error
//! → metervalues?
//! ← metervalues: 1250,7200   energy Wh, power W
//! ```

use thiserror::Error;
use tracing::warn;

use crate::domain::evse::{MeterReport, StatusReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvseCommand {
    Start,
    Stop,
    StatusQuery,
    MeterQuery,
}

impl EvseCommand {
    pub fn as_line(&self) -> &'static str {
        match self {
            Self::Start => "start\n",
            Self::Stop => "stop\n",
            Self::StatusQuery => "status?\n",
            Self::MeterQuery => "metervalues?\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvseReply {
    Status(StatusReport),
    Meter(MeterReport),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("reply has no header: {0:?}")]
    MissingHeader(String),

    #[error("unknown reply header {0:?}")]
    UnknownHeader(String),

    #[error("{kind} reply needs {expected} fields, got {got}")]
    TooFewFields {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Parse one reply line. Individual fields that cannot be read come back
/// as `None`; a reply with too few fields is rejected as a whole.
pub fn parse_reply(line: &str) -> Result<EvseReply, LineError> {
    let (header, body) = line
        .split_once(':')
        .ok_or_else(|| LineError::MissingHeader(line.trim().to_string()))?;

    match header.trim() {
        "status" => parse_status(body).map(EvseReply::Status),
        "metervalues" => parse_meter(body).map(EvseReply::Meter),
        other => Err(LineError::UnknownHeader(other.to_string())),
    }
}

fn fields(body: &str) -> Vec<&str> {
    body.split(',').map(|f| f.trim_matches(|c: char| c.is_whitespace() || c == ',')).collect()
}

fn parse_status(body: &str) -> Result<StatusReport, LineError> {
    let fields = fields(body);
    if fields.len() < 4 {
        return Err(LineError::TooFewFields {
            kind: "status",
            expected: 4,
            got: fields.len(),
        });
    }

    Ok(StatusReport {
        ev_connected: parse_flag("ev_connected", fields[0]),
        charging_enabled: parse_flag("charging_enabled", fields[1]),
        charging: parse_flag("charging", fields[2]),
        in_error: parse_flag("error", fields[3]),
    })
}

fn parse_meter(body: &str) -> Result<MeterReport, LineError> {
    let fields = fields(body);
    if fields.len() < 2 {
        return Err(LineError::TooFewFields {
            kind: "metervalues",
            expected: 2,
            got: fields.len(),
        });
    }

    Ok(MeterReport {
        energy_active_net_wh: parse_number("energy_active_net_wh", fields[0]),
        power_active_import_w: parse_number("power_active_import_w", fields[1]),
    })
}

fn parse_flag(name: &'static str, raw: &str) -> Option<bool> {
    match raw.parse::<i64>() {
        Ok(1) => Some(true),
        Ok(0) => Some(false),
        _ => {
            warn!(field = name, value = raw, "Unreadable EVSE status field, keeping previous value");
            None
        }
    }
}

fn parse_number(name: &'static str, raw: &str) -> Option<i64> {
    match raw.parse::<i64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(field = name, value = raw, "Unreadable EVSE meter field, keeping previous value");
            None
        }
    }
}
