//! Room fan-out for the relay.
//!
//! Every room has one tokio broadcast channel. A frame published by a peer is
//! delivered to every subscriber; receivers skip frames they published
//! themselves. Each receiver buffers up to `capacity` frames before it starts
//! lagging.
//!
//! Rooms also hand out replica sites. Sites start at 1 (0 belongs to the
//! document sentinels) and are never reused while the room lives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use tandem_core::SiteId;

/// A frame on its way through a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    /// Connection that published the frame
    pub from: Uuid,
    /// Encoded frame, forwarded untouched
    pub bytes: Vec<u8>,
}

/// A member of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub username: String,
    pub site: SiteId,
}

/// Result of joining a room.
pub struct Membership {
    pub peer: PeerInfo,
    /// The room had no members before this peer
    pub is_first: bool,
    pub receiver: broadcast::Receiver<Arc<RelayFrame>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters, read through [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct Members {
    peers: HashMap<Uuid, PeerInfo>,
    next_site: u32,
}

/// The members of one room and their shared channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    members: RwLock<Members>,
    capacity: usize,
    max_peers: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group buffering `capacity` frames per receiver and admitting at
    /// most `max_peers` members.
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(Members {
                peers: HashMap::new(),
                next_site: 1,
            }),
            capacity,
            max_peers,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Admit a peer and assign its site.
    ///
    /// Returns `None` when the room is full.
    pub async fn join(&self, peer_id: Uuid, username: impl Into<String>) -> Option<Membership> {
        let mut members = self.members.write().await;
        if members.peers.len() >= self.max_peers {
            return None;
        }

        let is_first = members.peers.is_empty();
        let site = SiteId(members.next_site);
        members.next_site += 1;

        let peer = PeerInfo {
            peer_id,
            username: username.into(),
            site,
        };
        members.peers.insert(peer_id, peer.clone());
        Some(Membership {
            peer,
            is_first,
            receiver: self.sender.subscribe(),
        })
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.members.write().await.peers.remove(peer_id)
    }

    /// Publish a frame to every subscriber, the publisher included.
    ///
    /// Returns the number of receivers.
    pub fn broadcast(&self, from: Uuid, bytes: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(RelayFrame { from, bytes }))
            .unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver lost.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.members.read().await.peers.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.members.read().await.peers.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.members.read().await.peers.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: members.peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps room names to broadcast groups.
///
/// Joining and leaving go through the manager so that a room is never removed
/// between lookup and join.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            max_peers,
        }
    }

    /// Join `room`, creating it if needed.
    ///
    /// Returns `None` when the room is full.
    pub async fn join(
        &self,
        room: &str,
        peer_id: Uuid,
        username: impl Into<String>,
    ) -> Option<(Arc<BroadcastGroup>, Membership)> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room.to_string())
            .or_insert_with(|| {
                Arc::new(BroadcastGroup::new(self.default_capacity, self.max_peers))
            })
            .clone();
        let membership = group.join(peer_id, username).await?;
        Some((group, membership))
    }

    /// Remove a peer, dropping its room once empty.
    pub async fn leave(&self, room: &str, peer_id: &Uuid) -> Option<PeerInfo> {
        let mut rooms = self.rooms.write().await;
        let group = rooms.get(room)?.clone();
        let peer = group.remove_peer(peer_id).await;
        if group.peer_count().await == 0 {
            rooms.remove(room);
            log::info!("Room {room} removed (empty)");
        }
        peer
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_assigns_sites_from_one() {
        let group = BroadcastGroup::new(16, 10);

        let alice = group.join(Uuid::new_v4(), "Alice").await.unwrap();
        let bob = group.join(Uuid::new_v4(), "Bob").await.unwrap();

        assert!(alice.is_first);
        assert!(!bob.is_first);
        assert_eq!(alice.peer.site, SiteId(1));
        assert_eq!(bob.peer.site, SiteId(2));
        assert_eq!(group.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_sites_not_reused() {
        let group = BroadcastGroup::new(16, 10);
        let alice = group.join(Uuid::new_v4(), "Alice").await.unwrap();
        group.remove_peer(&alice.peer.peer_id).await;

        let bob = group.join(Uuid::new_v4(), "Bob").await.unwrap();
        assert!(bob.is_first);
        assert_eq!(bob.peer.site, SiteId(2));
    }

    #[tokio::test]
    async fn test_room_full() {
        let group = BroadcastGroup::new(16, 1);
        let _alice = group.join(Uuid::new_v4(), "Alice").await.unwrap();
        assert!(group.join(Uuid::new_v4(), "Bob").await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16, 10);
        let alice = group.join(Uuid::new_v4(), "Alice").await.unwrap();
        let mut bob = group.join(Uuid::new_v4(), "Bob").await.unwrap();
        let mut carol = group.join(Uuid::new_v4(), "Carol").await.unwrap();

        // Publisher included; filtering is the receiver's job
        let count = group.broadcast(alice.peer.peer_id, vec![1, 2, 3]);
        assert_eq!(count, 3);

        let frame = bob.receiver.recv().await.unwrap();
        assert_eq!(frame.from, alice.peer.peer_id);
        assert_eq!(frame.bytes, vec![1, 2, 3]);
        assert_eq!(carol.receiver.recv().await.unwrap().bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16, 10);
        let alice = group.join(Uuid::new_v4(), "Alice").await.unwrap();

        group.broadcast(alice.peer.peer_id, vec![1]);
        group.broadcast(alice.peer.peer_id, vec![2]);
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_room_manager_shares_group() {
        let manager = RoomManager::new(16, 10);

        let (room1, _a) = manager.join("notes.txt", Uuid::new_v4(), "Alice").await.unwrap();
        let (room2, b) = manager.join("notes.txt", Uuid::new_v4(), "Bob").await.unwrap();

        assert!(Arc::ptr_eq(&room1, &room2));
        assert!(!b.is_first);
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_manager_isolates_rooms() {
        let manager = RoomManager::new(16, 10);

        let (_, a) = manager.join("a.txt", Uuid::new_v4(), "Alice").await.unwrap();
        let (_, b) = manager.join("b.txt", Uuid::new_v4(), "Bob").await.unwrap();
        assert!(a.is_first && b.is_first);

        let rooms = manager.active_rooms().await;
        assert!(rooms.contains(&"a.txt".to_string()));
        assert!(rooms.contains(&"b.txt".to_string()));
    }

    #[tokio::test]
    async fn test_room_removed_when_empty() {
        let manager = RoomManager::new(16, 10);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        manager.join("notes.txt", alice, "Alice").await.unwrap();
        manager.join("notes.txt", bob, "Bob").await.unwrap();

        assert_eq!(manager.leave("notes.txt", &alice).await.map(|p| p.username), Some("Alice".into()));
        assert_eq!(manager.room_count().await, 1);

        manager.leave("notes.txt", &bob).await;
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.get("notes.txt").await.is_none());
    }
}
