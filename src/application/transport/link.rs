//! Frame link abstraction
//!
//! The transport reads and writes whole text frames. The WebSocket
//! connector implements these traits over a split socket; [`memory_link`]
//! implements them over channels so a scripted CSMS can sit on the other
//! end.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::support::errors::TransportError;
use crate::support::ocpp_frame::Envelope;

#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, text: String) -> Result<(), TransportError>;

    /// Best-effort close; errors are ignored.
    async fn close(&mut self) {}
}

#[async_trait]
pub trait FrameReader: Send {
    /// Next text frame, or `None` once the peer has closed.
    async fn read_frame(&mut self) -> Option<Result<String, TransportError>>;
}

pub struct MemoryWriter {
    tx: mpsc::UnboundedSender<String>,
}

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// The far end of a [`memory_link`].
pub struct LoopbackPeer {
    from_station: mpsc::UnboundedReceiver<String>,
    to_station: mpsc::UnboundedSender<String>,
}

impl LoopbackPeer {
    /// Next frame written by the station, decoded. Frames that fail to
    /// decode are skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let text = self.from_station.recv().await?;
            if let Ok(envelope) = Envelope::decode(&text) {
                return Some(envelope);
            }
        }
    }

    pub async fn recv_raw(&mut self) -> Option<String> {
        self.from_station.recv().await
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.send_raw(envelope.encode())
    }

    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.to_station
            .send(text.into())
            .map_err(|_| TransportError::Closed)
    }
}

/// In-memory link: station-side writer and reader plus the peer end.
pub fn memory_link() -> (MemoryWriter, MemoryReader, LoopbackPeer) {
    let (station_tx, peer_rx) = mpsc::unbounded_channel();
    let (peer_tx, station_rx) = mpsc::unbounded_channel();
    (
        MemoryWriter { tx: station_tx },
        MemoryReader { rx: station_rx },
        LoopbackPeer {
            from_station: peer_rx,
            to_station: peer_tx,
        },
    )
}
