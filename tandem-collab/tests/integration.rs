//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real relay and connect real clients, verifying the full
//! pipeline from editor change to remote editor.

use futures_util::{SinkExt, StreamExt};
use tandem_collab::client::{ClientConfig, ConnectionState, SyncClient};
use tandem_collab::server::{RelayServer, ServerConfig};
use tandem_collab::session::{ClientSession, SessionConfig, SessionState};
use tandem_collab::{
    Available, DocumentId, Info, Initial, MemorySurface, Message, TextChange, TransportEvent,
};
use tandem_core::{SiteId, Snapshot};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(2);

/// Start a relay on a free port, return its base URL and a handle for stats.
async fn start_test_server(max_peers_per_room: usize) -> (String, RelayServer) {
    start_server(max_peers_per_room, 64).await
}

async fn start_server(max_peers_per_room: usize, broadcast_capacity: usize) -> (String, RelayServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        max_peers_per_room,
        broadcast_capacity,
    });
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), server)
}

fn info(username: &str) -> Vec<u8> {
    Message::Info(Info {
        session_share: false,
        username: username.into(),
        client_kind: "test".into(),
    })
    .encode()
    .unwrap()
}

type RawSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn raw_join(url: &str, username: &str) -> (RawSocket, Available) {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws.send(WsMessage::Binary(info(username).into())).await.unwrap();
    let reply = next_message(&mut ws).await;
    match reply {
        Message::Available(available) => (ws, available),
        other => panic!("expected AVAILABLE, got {other:?}"),
    }
}

async fn next_message(ws: &mut RawSocket) -> Message {
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(WsMessage::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                return Message::decode(&bytes).unwrap();
            }
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {other:?}"),
        }
    }
}

/// A replica wired to the relay through a [`SyncClient`].
struct Peer {
    doc: DocumentId,
    session: ClientSession<mpsc::UnboundedSender<Vec<u8>>>,
    editor: MemorySurface,
    events: mpsc::Receiver<TransportEvent>,
    _client: SyncClient,
}

impl Peer {
    async fn connect(url: &str, doc: &str, username: &str, host_text: Option<&str>) -> Self {
        let doc = DocumentId::new(doc);
        let config = ClientConfig {
            server_url: url.to_string(),
            session: SessionConfig {
                username: username.to_string(),
                ..SessionConfig::default()
            },
        };
        let mut client = SyncClient::new(config, doc.name());
        let events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();
        assert_eq!(client.connection_state().await, ConnectionState::Connected);

        let mut editor = MemorySurface::new();
        let mut session = match host_text {
            Some(text) => {
                editor.open(&doc, text);
                client.host_session(doc.clone(), text).unwrap()
            }
            None => {
                editor.open(&doc, "");
                client.guest_session(doc.clone()).unwrap()
            }
        };
        session.on_connected().unwrap();

        Self {
            doc,
            session,
            editor,
            events,
            _client: client,
        }
    }

    /// Process one transport event and the editor changes it causes.
    async fn pump_one(&mut self) {
        let event = timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("event channel closed");
        match event {
            TransportEvent::Frame(bytes) => {
                self.session.handle_frame(&bytes, &mut self.editor).unwrap();
            }
            TransportEvent::Closed => panic!("transport closed"),
        }
        for (_, change) in self.editor.drain_changes() {
            self.session.report_change(&change).unwrap();
        }
    }

    async fn pump_until(&mut self, state: SessionState) {
        while self.session.state() != state {
            self.pump_one().await;
        }
    }

    fn edit(&mut self, change: TextChange) {
        let change = self.editor.edit(&self.doc, change).unwrap();
        self.session.report_change(&change).unwrap();
    }

    fn editor_text(&self) -> &str {
        self.editor.text(&self.doc).unwrap()
    }
}

#[tokio::test]
async fn test_relay_assigns_sites_in_order() {
    let (url, server) = start_test_server(10).await;
    let room = format!("{url}/notes.txt");

    let (_alice, first) = raw_join(&room, "alice").await;
    let (_bob, second) = raw_join(&room, "bob").await;

    assert_eq!(
        first,
        Available {
            is_first: true,
            site: SiteId(1),
            session_share: false
        }
    );
    assert!(!second.is_first);
    assert_eq!(second.site, SiteId(2));
    assert_eq!(server.stats().await.active_rooms, 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, _server) = start_test_server(10).await;

    let (_a, in_a) = raw_join(&format!("{url}/a.txt"), "alice").await;
    let (_b, in_b) = raw_join(&format!("{url}/b.txt"), "bob").await;
    assert!(in_a.is_first);
    assert!(in_b.is_first);
    assert_eq!(in_b.site, SiteId(1));
}

#[tokio::test]
async fn test_relay_forwards_to_others_only() {
    let (url, _server) = start_test_server(10).await;
    let room = format!("{url}/notes.txt");

    let (mut alice, _) = raw_join(&room, "alice").await;
    let (mut bob, _) = raw_join(&room, "bob").await;

    bob.send(WsMessage::Binary(Message::Request.encode().unwrap().into()))
        .await
        .unwrap();
    assert_eq!(next_message(&mut alice).await, Message::Request);

    // Nothing comes back to the sender
    let echoed = timeout(Duration::from_millis(200), bob.next()).await;
    assert!(echoed.is_err(), "sender received its own frame");
}

#[tokio::test]
async fn test_relay_drops_malformed_frames() {
    let (url, server) = start_test_server(10).await;
    let room = format!("{url}/notes.txt");

    let (mut ws, _) = tokio_tungstenite::connect_async(&room).await.unwrap();
    ws.send(WsMessage::Binary(vec![0x09u8].into())).await.unwrap();
    ws.send(WsMessage::Binary(info("alice").into())).await.unwrap();

    match next_message(&mut ws).await {
        Message::Available(available) => assert!(available.is_first),
        other => panic!("expected AVAILABLE, got {other:?}"),
    }
    assert_eq!(server.stats().await.rejected_frames, 1);
}

#[tokio::test]
async fn test_relay_refuses_full_room() {
    let (url, _server) = start_test_server(1).await;
    let room = format!("{url}/notes.txt");

    let (_alice, _) = raw_join(&room, "alice").await;
    let (mut bob, _) = tokio_tungstenite::connect_async(&room).await.unwrap();
    bob.send(WsMessage::Binary(info("bob").into())).await.unwrap();

    let reply = timeout(WAIT, bob.next()).await.unwrap();
    assert!(
        !matches!(reply, Some(Ok(WsMessage::Binary(_)))),
        "full room admitted a peer"
    );
}

#[tokio::test]
async fn test_empty_room_removed() {
    let (url, server) = start_test_server(10).await;
    let room = format!("{url}/notes.txt");

    let (mut alice, _) = raw_join(&room, "alice").await;
    assert_eq!(server.rooms().room_count().await, 1);

    alice.close(None).await.unwrap();
    for _ in 0..50 {
        if server.rooms().room_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.rooms().room_count().await, 0);

    let (_bob, rejoined) = raw_join(&room, "bob").await;
    assert!(rejoined.is_first);
}

#[tokio::test]
async fn test_lagging_peer_is_disconnected() {
    const FRAMES: u64 = 64;
    let (url, server) = start_server(10, 2).await;
    let room = format!("{url}/notes.txt");

    let (mut alice, _) = raw_join(&room, "alice").await;
    let (mut bob, _) = raw_join(&room, "bob").await;

    // Bob stops reading while Alice sends far more than his socket can buffer
    let frame = Message::Initial(Initial {
        buffer_name: "x".repeat(512 * 1024),
        buffer_ref: String::new(),
        snapshot: Snapshot {
            pids: Vec::new(),
            lines: Vec::new(),
        },
    })
    .encode()
    .unwrap();
    for _ in 0..FRAMES {
        alice.send(WsMessage::Binary(frame.clone().into())).await.unwrap();
    }
    timeout(Duration::from_secs(30), async {
        while server.stats().await.total_messages < FRAMES + 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut received = 0;
    loop {
        match timeout(Duration::from_secs(30), bob.next()).await.unwrap() {
            Some(Ok(WsMessage::Binary(_))) => received += 1,
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }
    assert!(received < FRAMES, "bob received every frame");
    assert_eq!(server.stats().await.lagged_disconnects, 1);

    // Alice keeps her connection
    alice.send(WsMessage::Binary(Message::Request.encode().unwrap().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_host_and_guest_synchronize() {
    let (url, _server) = start_test_server(10).await;

    let mut host = Peer::connect(&url, "/home/alice/notes.txt", "alice", Some("ab")).await;
    host.pump_until(SessionState::Synchronized).await;
    assert_eq!(host.session.site(), Some(SiteId(1)));

    let mut guest = Peer::connect(&url, "/home/bob/notes.txt", "bob", None).await;
    guest.pump_until(SessionState::AwaitingSnapshot).await;

    // REQUEST reaches the host, INITIAL comes back
    host.pump_one().await;
    guest.pump_until(SessionState::Synchronized).await;
    assert_eq!(guest.editor_text(), "ab");
    assert_eq!(guest.session.site(), Some(SiteId(2)));

    host.edit(TextChange::insert(2, "c"));
    guest.pump_one().await;
    assert_eq!(guest.editor_text(), "abc");

    guest.edit(TextChange::delete(0, 1));
    host.pump_one().await;
    assert_eq!(host.editor_text(), "bc");
    assert_eq!(host.session.text(), guest.session.text());
}

#[tokio::test]
async fn test_client_reports_close() {
    let (url, _server) = start_test_server(1).await;

    let mut alice = Peer::connect(&url, "notes.txt", "alice", Some("")).await;
    alice.pump_until(SessionState::Synchronized).await;

    // A second host is refused by the full room and its socket is closed
    let config = ClientConfig {
        server_url: url.clone(),
        ..ClientConfig::default()
    };
    let mut client = SyncClient::new(config, "notes.txt");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.outbound().unwrap().send(info("bob")).unwrap();

    let event = timeout(WAIT, events.recv()).await.unwrap();
    assert_eq!(event, Some(TransportEvent::Closed));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}
