//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌──► Client B
//!            ├── Room (path) ──┤
//! Client C ──┘  BroadcastGroup └──► Client C
//! ```
//!
//! A connection's room is the path of its websocket URL. The relay does not
//! keep document state: it answers INFO with AVAILABLE (assigning the next
//! site in the room) and forwards TEXT, REQUEST and INITIAL frames untouched
//! to every other member. Frames that fail validation are dropped. A peer
//! that falls more than `broadcast_capacity` frames behind its room is
//! disconnected, since the frames it missed are gone.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RelayFrame, RoomManager};
use crate::protocol::{Available, Message};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Frames a peer may fall behind its room before it is disconnected
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    /// Peers disconnected because their room receiver overflowed
    pub lagged_disconnects: u64,
    pub active_rooms: usize,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The relay server. Cheap to clone; clones share rooms and statistics.
#[derive(Clone)]
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                let room_count = server.rooms.room_count().await;
                let mut s = server.stats.write().await;
                s.active_connections -= 1;
                s.active_rooms = room_count;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut path = String::new();
        let capture_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
        let room = room_name(&path);

        let peer_id = Uuid::new_v4();
        log::info!("WebSocket connection {peer_id} from {addr} for room {room}");

        let mut joined = None;
        let outcome = self.relay(ws_stream, addr, &room, peer_id, &mut joined).await;

        if joined.is_some() {
            if let Some(peer) = self.rooms.leave(&room, &peer_id).await {
                log::info!("{} (site {}) left room {room}", peer.username, peer.site);
            }
        }
        outcome
    }

    /// Pump frames between one websocket and its room until either side closes.
    async fn relay(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        room: &str,
        peer_id: Uuid,
        joined: &mut Option<(Arc<BroadcastGroup>, broadcast::Receiver<Arc<RelayFrame>>)>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Drain the room before reading more from the socket, so a
                // peer's own frames never pile up in its receiver.
                biased;

                frame = async {
                    match joined.as_mut() {
                        Some((_, rx)) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if frame.from == peer_id {
                                continue;
                            }
                            ws_sender.send(WsMessage::Binary(frame.bytes.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Missed frames are gone for good
                            log::warn!("Peer {peer_id} lagged by {n} frames, disconnecting");
                            if let Some((group, _)) = joined.as_ref() {
                                group.record_dropped(n);
                            }
                            self.stats.write().await.lagged_disconnects += 1;
                            let _ = ws_sender.close().await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let message = match Message::decode(&bytes) {
                                Ok(message) => message,
                                Err(e) => {
                                    log::warn!("Dropping malformed frame from {peer_id}: {e}");
                                    self.stats.write().await.rejected_frames += 1;
                                    continue;
                                }
                            };

                            match message {
                                Message::Info(info) => {
                                    if joined.is_some() {
                                        log::warn!("Ignoring repeated INFO from {peer_id}");
                                        continue;
                                    }
                                    let Some((group, membership)) =
                                        self.rooms.join(room, peer_id, info.username.clone()).await
                                    else {
                                        log::warn!("Room {room} is full, refusing {}", info.username);
                                        let _ = ws_sender.close().await;
                                        break;
                                    };
                                    let site = membership.peer.site;
                                    let is_first = membership.is_first;
                                    *joined = Some((group, membership.receiver));

                                    let available = Message::Available(Available {
                                        is_first,
                                        site,
                                        session_share: info.session_share,
                                    });
                                    ws_sender.send(WsMessage::Binary(available.encode()?.into())).await?;

                                    let room_count = self.rooms.room_count().await;
                                    self.stats.write().await.active_rooms = room_count;
                                    log::info!(
                                        "{} ({}, {peer_id}) joined room {room} as site {site}{}",
                                        info.username,
                                        info.client_kind,
                                        if is_first { ", first" } else { "" }
                                    );
                                }
                                Message::Available(_) => {
                                    log::warn!("Dropping AVAILABLE sent by client {peer_id}");
                                }
                                message => match joined.as_ref() {
                                    Some((group, _)) => {
                                        log::debug!("Relaying {:?} from {peer_id}", message.message_type());
                                        group.broadcast(peer_id, bytes);
                                    }
                                    None => {
                                        log::warn!(
                                            "Dropping {:?} from {peer_id} before INFO",
                                            message.message_type()
                                        );
                                    }
                                },
                            }
                        }

                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// Room addressed by a websocket request path.
fn room_name(path: &str) -> String {
    let name = path.trim_start_matches('/');
    if name.is_empty() {
        "default".to_string()
    } else {
        name.to_string()
    }
}
