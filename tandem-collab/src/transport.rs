//! Outbound seam between a session and its connection.

use tokio::sync::mpsc;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// What a connection hands back to the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A binary frame from the relay
    Frame(Vec<u8>),
    /// The connection is gone
    Closed,
}

/// Sink for encoded frames.
pub trait Outbound {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Feeds the websocket writer task.
impl Outbound for mpsc::UnboundedSender<Vec<u8>> {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.send(frame).map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Collects frames in memory, for loopback wiring and tests.
impl Outbound for Vec<Vec<u8>> {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.push(frame);
        Ok(())
    }
}
