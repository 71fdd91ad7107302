//! EVSE controller link (TCP, line protocol)

pub mod connector;
pub mod line_protocol;

pub use connector::{EvseConnector, PollOptions};
pub use line_protocol::{parse_reply, EvseCommand, EvseReply, LineError};
