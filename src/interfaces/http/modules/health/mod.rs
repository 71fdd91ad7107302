//! Liveness of the station and its CSMS link

pub mod handlers;

pub use handlers::*;
