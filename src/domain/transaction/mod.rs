//! Transaction aggregate
//!
//! One [`Transaction`] per charging session, advanced through its phases by
//! the station's transaction coordinator.

pub mod model;

pub use model::{
    MeterSample, Transaction, TransactionEvent, TransactionEventType, TransactionPhase,
    TransitionError, TriggerReason,
};
