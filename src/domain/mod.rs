pub mod evse;
pub mod transaction;

pub use evse::{Edge, EdgeEvent, EvseFlag, EvseState};
pub use transaction::{Transaction, TransactionPhase};
