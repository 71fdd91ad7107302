pub mod controller;
pub mod coordinator;
pub mod handlers;
pub mod messages;
pub mod variables;

pub use controller::{ChargingStation, StationSettings, StationTasks};
pub use coordinator::TransactionSnapshot;
pub use handlers::{HandlerError, InboundHandler, InboundRouter};
pub use messages::{BootOutcome, StationIdentity};
pub use variables::{StationVariables, VariableStatus};
