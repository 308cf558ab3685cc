//! WebSocket transport for a synchronization session.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Sessions for the room, built from [`ClientConfig::session`] and wired to
//!   the outbound frame sender
//! - A stream of [`TransportEvent`]s for the owner to feed back into the session
//!
//! The client does not interpret frames; the session does.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::editor::DocumentId;
use crate::session::{ClientSession, SessionConfig, SessionError};
use crate::transport::{TransportError, TransportEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL; the room is appended as the path
    pub server_url: String,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            session: SessionConfig::default(),
        }
    }
}

/// Connection to one relay room.
pub struct SyncClient {
    config: ClientConfig,
    room: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Feeds the websocket writer task
    outgoing_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, room: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            config,
            room: room.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Full websocket URL of the room.
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.config.server_url.trim_end_matches('/'),
            self.room.trim_start_matches('/')
        )
    }

    /// Connect to the relay.
    ///
    /// Spawns a writer task draining the outbound channel and a reader task
    /// emitting [`TransportEvent`]s. The reader emits [`TransportEvent::Closed`]
    /// once when the connection ends.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.url();
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(TransportError::WebSocket(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward outgoing channel to WebSocket, close once every
        // sender is gone
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(WsMessage::Binary(data.into())).await {
                    log::warn!("Send failed: {e}");
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {url}");

        // Reader task: surface binary frames to the owner
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => {
                        if event_tx.send(TransportEvent::Frame(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        log::warn!("Connection to {url} failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(TransportEvent::Closed).await;
            log::info!("Disconnected from {url}");
        });

        Ok(())
    }

    /// A sender for the session's outbound frames.
    pub fn outbound(&self) -> Result<mpsc::UnboundedSender<Vec<u8>>, TransportError> {
        self.outgoing_tx
            .clone()
            .ok_or(TransportError::ConnectionClosed)
    }

    /// Host `document` over this connection.
    pub fn host_session(
        &self,
        document: DocumentId,
        text: impl Into<String>,
    ) -> Result<ClientSession<mpsc::UnboundedSender<Vec<u8>>>, SessionError> {
        ClientSession::host(document, text, self.config.session.clone(), self.outbound()?)
    }

    /// Join `document` over this connection.
    pub fn guest_session(
        &self,
        document: DocumentId,
    ) -> Result<ClientSession<mpsc::UnboundedSender<Vec<u8>>>, SessionError> {
        Ok(ClientSession::guest(
            document,
            self.config.session.clone(),
            self.outbound()?,
        ))
    }

    /// Drop our outbound sender. The websocket closes once sessions holding a
    /// sender from [`SyncClient::outbound`] drop theirs too.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.config.session
    }
}
