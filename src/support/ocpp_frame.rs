//! OCPP-J envelope codec
//!
//! Every message exchanged with the CSMS is a JSON array whose first element
//! is a numeric message-type discriminant:
//!
//! - **Call**       `[2, "<messageId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<messageId>", {<payload>}]`
//! - **CallError**  `[4, "<messageId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::{json, Value};
use thiserror::Error;

// ── Message-type discriminant ──────────────────────────────────

/// Numeric message type carried in slot 0 of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageKind {
    fn min_len(self) -> usize {
        match self {
            Self::Call => 4,
            Self::CallResult => 3,
            Self::CallError => 4,
        }
    }
}

impl TryFrom<u64> for MessageKind {
    type Error = EnvelopeError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Call),
            3 => Ok(Self::CallResult),
            4 => Ok(Self::CallError),
            other => Err(EnvelopeError::UnknownMessageType(other)),
        }
    }
}

/// Standard OCPP-J error codes used when answering pushed calls.
pub mod error_code {
    pub const NOT_IMPLEMENTED: &str = "NotImplemented";
    pub const FORMATION_VIOLATION: &str = "FormationViolation";
    pub const INTERNAL_ERROR: &str = "InternalError";
}

// ── Envelope ───────────────────────────────────────────────────

/// A decoded wire envelope, tagged by its message-type discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl Envelope {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let slots: Vec<Value> = serde_json::from_str(text)?;

        let kind = slots
            .first()
            .ok_or(EnvelopeError::EmptyArray)?
            .as_u64()
            .ok_or(EnvelopeError::InvalidMessageType)
            .and_then(MessageKind::try_from)?;

        if slots.len() < kind.min_len() {
            return Err(EnvelopeError::MissingFields {
                kind,
                expected: kind.min_len(),
                got: slots.len(),
            });
        }

        let message_id = string_slot(&slots, 1, "messageId")?;

        Ok(match kind {
            MessageKind::Call => Self::Call {
                message_id,
                action: string_slot(&slots, 2, "action")?,
                payload: slots[3].clone(),
            },
            MessageKind::CallResult => Self::CallResult {
                message_id,
                payload: slots[2].clone(),
            },
            MessageKind::CallError => Self::CallError {
                message_id,
                error_code: slots[2].as_str().unwrap_or(error_code::INTERNAL_ERROR).to_string(),
                error_description: slots
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                error_details: slots.get(4).cloned().unwrap_or_else(|| json!({})),
            },
        })
    }

    /// Encode to the JSON text sent on the wire.
    pub fn encode(&self) -> String {
        let slots = match self {
            Self::Call {
                message_id,
                action,
                payload,
            } => json!([MessageKind::Call as u8, message_id, action, payload]),
            Self::CallResult {
                message_id,
                payload,
            } => json!([MessageKind::CallResult as u8, message_id, payload]),
            Self::CallError {
                message_id,
                error_code,
                error_description,
                error_details,
            } => json!([
                MessageKind::CallError as u8,
                message_id,
                error_code,
                error_description,
                error_details
            ]),
        };
        slots.to_string()
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Call { .. } => MessageKind::Call,
            Self::CallResult { .. } => MessageKind::CallResult,
            Self::CallError { .. } => MessageKind::CallError,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::Call { message_id, .. }
            | Self::CallResult { message_id, .. }
            | Self::CallError { message_id, .. } => message_id,
        }
    }

    /// Build a `CallError` answering the call with the given id.
    pub fn error_reply(
        message_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            message_id: message_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: json!({}),
        }
    }
}

fn string_slot(slots: &[Value], index: usize, name: &'static str) -> Result<String, EnvelopeError> {
    slots[index]
        .as_str()
        .map(str::to_string)
        .ok_or(EnvelopeError::FieldTypeMismatch(name))
}

// ── Errors ─────────────────────────────────────────────────────

/// Reasons a text frame could not be decoded into an [`Envelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Empty OCPP message array")]
    EmptyArray,

    #[error("Message type is not a number")]
    InvalidMessageType,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("{kind:?} needs at least {expected} fields, got {got}")]
    MissingFields {
        kind: MessageKind,
        expected: usize,
        got: usize,
    },

    #[error("{0} must be a string")]
    FieldTypeMismatch(&'static str),
}
