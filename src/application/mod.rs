pub mod charging;
pub mod transport;

// Re-export key types for convenience
pub use charging::{ChargingStation, StationIdentity, StationSettings, TransactionSnapshot};
pub use transport::{CsmsTransport, InboundCall, TransportConfig};
