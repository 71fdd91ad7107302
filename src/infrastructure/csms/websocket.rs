//! WebSocket client for the CSMS connection.
//!
//! Connects to `ws://<host>/<path>/<station_id>` with the OCPP 2.0.1
//! subprotocol and exposes the split socket as a frame link.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::application::transport::{FrameReader, FrameWriter};
use crate::support::errors::{BootstrapError, TransportError};

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsFrameWriter {
    sink: SplitSink<WsStream, Message>,
}

pub struct WsFrameReader {
    stream: SplitStream<WsStream>,
}

/// Open the CSMS connection. Failure here is fatal at startup.
pub async fn connect(url: &str) -> Result<(WsFrameWriter, WsFrameReader), BootstrapError> {
    let connect_error = |reason: String| BootstrapError::CsmsConnect {
        url: url.to_string(),
        reason,
    };

    let mut request = url
        .into_client_request()
        .map_err(|e| connect_error(e.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(OCPP_SUBPROTOCOL),
    );

    let (socket, response) = connect_async(request)
        .await
        .map_err(|e| connect_error(e.to_string()))?;

    match response.headers().get("Sec-WebSocket-Protocol") {
        Some(protocol) => info!(url, protocol = ?protocol, "🔗 Connected to CSMS"),
        None => warn!(url, "🔗 Connected to CSMS without subprotocol confirmation"),
    }

    let (sink, stream) = socket.split();
    Ok((WsFrameWriter { sink }, WsFrameReader { stream }))
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "CSMS close handshake failed");
        }
    }
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    warn!(bytes = data.len(), "Binary frame from CSMS, ignoring");
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "Close frame received from CSMS");
                    return None;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(TransportError::Connection(e.to_string()))),
            }
        }
        None
    }
}
