use std::path::PathBuf;

use thiserror::Error;

use crate::domain::transaction::TransactionPhase;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Outbound queue is full")]
    Busy,

    #[error("Transport is closed")]
    Closed,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Call was dropped without a response")]
    NoResponse,

    #[error("CallError {code}: {description}")]
    CallError { code: String, description: String },
}

#[derive(Debug, Error)]
pub enum StationError {
    #[error("Unknown EVSE id {0}")]
    UnknownEvse(i32),

    #[error("EVSE {0} already has an active transaction")]
    TransactionActive(i32),

    #[error("EVSE {0} has no active transaction")]
    NoActiveTransaction(i32),

    #[error("Transaction on EVSE {evse_id} cannot {action} while {phase}")]
    InvalidPhase {
        evse_id: i32,
        action: &'static str,
        phase: TransactionPhase,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Station controller has stopped")]
    ControllerStopped,
}

/// Startup failures. These are the only errors that stop the process.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("At least one EVSE address must be configured")]
    NoEvses,

    #[error("Failed to read credential file {path}: {source}")]
    Credential {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to EVSE {evse_id} at {addr}: {source}")]
    EvseConnect {
        evse_id: i32,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to CSMS at {url}: {reason}")]
    CsmsConnect { url: String, reason: String },

    #[error("Failed to bind display server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
