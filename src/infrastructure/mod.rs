//! Infrastructure layer - links to the outside world

pub mod csms;
pub mod evse;

pub use evse::EvseConnector;
