//! CSMS WebSocket link

pub mod websocket;

pub use websocket::{connect, WsFrameReader, WsFrameWriter, OCPP_SUBPROTOCOL};
