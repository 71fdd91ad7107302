//! # OCPP Charging Station
//!
//! OCPP 2.0.1 charging station client: talks OCPP-J to a CSMS over
//! WebSocket, drives EVSE controllers over a TCP line protocol and serves a
//! local operator display API.
//!
//! ## Architecture
//!
//! - **support**: OCPP-J envelope codec, error types, shutdown signal
//! - **domain**: EVSE readings with edge hooks, transaction state machine
//! - **application**: CSMS transport, charging controller and coordinator
//! - **infrastructure**: EVSE TCP connector, CSMS WebSocket connector
//! - **interfaces**: operator display REST API with Swagger documentation
//! - **station**: runtime bootstrap used by the CLI

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interfaces;
pub mod station;
pub mod support;

pub use config::{default_config_path, AppConfig};

pub use application::{ChargingStation, CsmsTransport};

pub use station::{init_tracing, StationHandle};
