//! Charging transaction state machine
//!
//! ```text
//! Created ─begin─▶ AwaitingAuthorization ─authorize─▶ InProgress ─request_stop─▶ AwaitingStopAuthorization
//!                        │                              ▲   │ periodic_update            │        │
//!                        └─reject_authorization─▶ Ended  │   └──────────────┘             │        │
//!                                                        └──────────reject_stop───────────┘        │
//!                                                   Ended ◀─end─ Ending ◀─authorize_stop────────────┘
//! ```
//!
//! Every transition that emits a [`TransactionEvent`] consumes exactly one
//! sequence number. Transitions that emit nothing leave the counter alone.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionPhase {
    Created,
    AwaitingAuthorization,
    InProgress,
    AwaitingStopAuthorization,
    Ending,
    Ended,
}

impl TransactionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::AwaitingAuthorization => "AwaitingAuthorization",
            Self::InProgress => "InProgress",
            Self::AwaitingStopAuthorization => "AwaitingStopAuthorization",
            Self::Ending => "Ending",
            Self::Ended => "Ended",
        }
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `eventType` of a TransactionEvent request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionEventType {
    Started,
    Updated,
    Ended,
}

/// `triggerReason` of a TransactionEvent request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerReason {
    CablePluggedIn,
    Authorized,
    ChargingStateChanged,
    StopAuthorized,
    #[serde(rename = "EVCommunicationLost")]
    EvCommunicationLost,
}

/// EVSE readings captured at the moment an event is emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeterSample {
    pub energy_active_net_wh: i64,
    pub power_active_import_w: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionEvent {
    pub transaction_id: Uuid,
    pub evse_id: i32,
    pub seq_no: u64,
    pub event_type: TransactionEventType,
    pub trigger_reason: TriggerReason,
    pub timestamp: DateTime<Utc>,
    pub sample: MeterSample,
    /// Present on `Authorized` and `StopAuthorized`.
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot {action} while {phase}")]
pub struct TransitionError {
    pub action: &'static str,
    pub phase: TransactionPhase,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub evse_id: i32,
    pub id_token: String,
    pub started_at: DateTime<Utc>,
    stop_token: Option<String>,
    next_seq_no: u64,
    phase: TransactionPhase,
    phase_entered: Instant,
    in_progress: bool,
}

impl Transaction {
    pub fn new(evse_id: i32, id_token: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            evse_id,
            id_token: id_token.into(),
            started_at: Utc::now(),
            stop_token: None,
            next_seq_no: 0,
            phase: TransactionPhase::Created,
            phase_entered: Instant::now(),
            in_progress: false,
        }
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    /// Sequence number the next emitted event will carry.
    pub fn next_seq_no(&self) -> u64 {
        self.next_seq_no
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Time spent in the current phase.
    pub fn phase_age(&self) -> std::time::Duration {
        self.phase_entered.elapsed()
    }

    /// A transaction is active until it reaches `Ended`.
    pub fn is_active(&self) -> bool {
        self.phase != TransactionPhase::Ended
    }

    /// Whether the periodic update loop should emit on this tick.
    pub fn accepts_periodic_update(&self) -> bool {
        self.in_progress
            && matches!(
                self.phase,
                TransactionPhase::InProgress
                    | TransactionPhase::AwaitingStopAuthorization
                    | TransactionPhase::Ending
            )
    }

    /// `Created → AwaitingAuthorization`, emitting Started/CablePluggedIn.
    pub fn begin(&mut self, sample: MeterSample) -> Result<TransactionEvent, TransitionError> {
        self.expect_phase("begin", &[TransactionPhase::Created])?;
        self.enter(TransactionPhase::AwaitingAuthorization);
        Ok(self.emit(
            TransactionEventType::Started,
            TriggerReason::CablePluggedIn,
            sample,
            None,
        ))
    }

    /// `AwaitingAuthorization → InProgress`, emitting Updated/Authorized.
    pub fn authorize(&mut self, sample: MeterSample) -> Result<TransactionEvent, TransitionError> {
        self.expect_phase("authorize", &[TransactionPhase::AwaitingAuthorization])?;
        self.enter(TransactionPhase::InProgress);
        self.in_progress = true;
        let token = Some(self.id_token.clone());
        Ok(self.emit(
            TransactionEventType::Updated,
            TriggerReason::Authorized,
            sample,
            token,
        ))
    }

    /// `AwaitingAuthorization → Ended` without emitting anything.
    pub fn reject_authorization(&mut self) -> Result<(), TransitionError> {
        self.expect_phase("reject authorization", &[TransactionPhase::AwaitingAuthorization])?;
        self.enter(TransactionPhase::Ended);
        self.in_progress = false;
        Ok(())
    }

    /// InProgress self-loop, emitting Updated/ChargingStateChanged.
    pub fn periodic_update(
        &mut self,
        sample: MeterSample,
    ) -> Result<TransactionEvent, TransitionError> {
        if !self.accepts_periodic_update() {
            return Err(TransitionError {
                action: "send periodic update",
                phase: self.phase,
            });
        }
        Ok(self.emit(
            TransactionEventType::Updated,
            TriggerReason::ChargingStateChanged,
            sample,
            None,
        ))
    }

    /// `InProgress → AwaitingStopAuthorization`. Repeating the request while
    /// already awaiting stop authorization replaces the stop token.
    pub fn request_stop(&mut self, stop_token: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_phase(
            "request stop",
            &[
                TransactionPhase::InProgress,
                TransactionPhase::AwaitingStopAuthorization,
            ],
        )?;
        self.stop_token = Some(stop_token.into());
        self.enter(TransactionPhase::AwaitingStopAuthorization);
        Ok(())
    }

    /// `AwaitingStopAuthorization → Ending`, emitting Updated/StopAuthorized.
    pub fn authorize_stop(
        &mut self,
        sample: MeterSample,
    ) -> Result<TransactionEvent, TransitionError> {
        self.expect_phase("authorize stop", &[TransactionPhase::AwaitingStopAuthorization])?;
        self.enter(TransactionPhase::Ending);
        let token = self.stop_token.clone();
        Ok(self.emit(
            TransactionEventType::Updated,
            TriggerReason::StopAuthorized,
            sample,
            token,
        ))
    }

    /// `AwaitingStopAuthorization → InProgress` without emitting anything.
    pub fn reject_stop(&mut self) -> Result<(), TransitionError> {
        self.expect_phase("reject stop", &[TransactionPhase::AwaitingStopAuthorization])?;
        self.stop_token = None;
        self.enter(TransactionPhase::InProgress);
        Ok(())
    }

    /// `Ending → Ended`, emitting Ended/EVCommunicationLost. `in_progress`
    /// stays set until [`Transaction::close`].
    pub fn end(&mut self, sample: MeterSample) -> Result<TransactionEvent, TransitionError> {
        self.expect_phase("end", &[TransactionPhase::Ending])?;
        self.enter(TransactionPhase::Ended);
        Ok(self.emit(
            TransactionEventType::Ended,
            TriggerReason::EvCommunicationLost,
            sample,
            None,
        ))
    }

    /// Clear `in_progress` once the Ended event was delivered or attempted.
    pub fn close(&mut self) {
        self.in_progress = false;
    }

    /// Drop the transaction from any phase without emitting an event.
    pub fn abandon(&mut self) {
        self.enter(TransactionPhase::Ended);
        self.in_progress = false;
    }

    fn expect_phase(
        &self,
        action: &'static str,
        allowed: &[TransactionPhase],
    ) -> Result<(), TransitionError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(TransitionError {
                action,
                phase: self.phase,
            })
        }
    }

    fn enter(&mut self, phase: TransactionPhase) {
        self.phase = phase;
        self.phase_entered = Instant::now();
    }

    fn emit(
        &mut self,
        event_type: TransactionEventType,
        trigger_reason: TriggerReason,
        sample: MeterSample,
        id_token: Option<String>,
    ) -> TransactionEvent {
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        TransactionEvent {
            transaction_id: self.id,
            evse_id: self.evse_id,
            seq_no,
            event_type,
            trigger_reason,
            timestamp: Utc::now(),
            sample,
            id_token,
        }
    }
}
