//! Room and client registry owned by the relay.
//!
//! Rooms live in a `DashMap`; every mutation of a room happens while holding that
//! room's entry, so membership and the file list have a single writer at a time and
//! delete-on-empty is atomic with respect to joins. When both maps are touched the
//! order is always rooms → clients.

use crate::common::{now_millis, ClientId, ErrorCode, FileInfo, RelayError, RoomId};
use crate::relay::protocol::{ServerMessage, SharedFile};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Room {
    pub id: RoomId,
    /// Join order
    pub members: Vec<ClientId>,
    pub files: Vec<SharedFile>,
    pub created_at: Instant,
}

impl Room {
    fn new(id: RoomId, creator: ClientId) -> Self {
        Self {
            id,
            members: vec![creator],
            files: Vec::new(),
            created_at: Instant::now(),
        }
    }

    fn is_member(&self, client_id: &str) -> bool {
        self.members.iter().any(|m| m == client_id)
    }
}

/// Public view of a room for the HTTP API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub user_count: usize,
    pub files: Vec<SharedFile>,
}

struct ClientEntry {
    /// Bounded; a client that stops reading loses events instead of growing the relay
    tx: mpsc::Sender<ServerMessage>,
    rooms: HashSet<RoomId>,
    local_addresses: Vec<String>,
    public_address: Option<IpAddr>,
    /// Peers this client exchanged signals with
    peers: HashSet<ClientId>,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<RoomId, Room>>,
    clients: Arc<DashMap<ClientId, ClientEntry>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and greet it with its id
    pub fn register_client(
        &self,
        tx: mpsc::Sender<ServerMessage>,
        public_address: Option<IpAddr>,
    ) -> ClientId {
        let client_id = Uuid::new_v4().to_string();
        let _ = tx.try_send(ServerMessage::Connected {
            client_id: client_id.clone(),
        });

        self.clients.insert(
            client_id.clone(),
            ClientEntry {
                tx,
                rooms: HashSet::new(),
                local_addresses: Vec::new(),
                public_address,
                peers: HashSet::new(),
            },
        );
        debug!(client_id = %client_id, clients = self.clients.len(), "client registered");
        client_id
    }

    pub fn create_room(&self, client_id: &str) -> Result<RoomId, RelayError> {
        if !self.clients.contains_key(client_id) {
            return Err(RelayError::UnknownClient(client_id.to_string()));
        }

        let room_id = Uuid::new_v4().to_string();
        self.rooms.insert(
            room_id.clone(),
            Room::new(room_id.clone(), client_id.to_string()),
        );

        if let Some(mut client) = self.clients.get_mut(client_id) {
            client.rooms.insert(room_id.clone());
        }

        self.send_to(
            client_id,
            ServerMessage::RoomCreated {
                room_id: room_id.clone(),
                client_id: client_id.to_string(),
            },
        );
        info!(room_id = %room_id, client_id = %client_id, "room created");
        Ok(room_id)
    }

    pub fn join_room(&self, client_id: &str, room_id: &str) -> Result<(), RelayError> {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            debug!(room_id = %room_id, client_id = %client_id, "join for unknown room");
            return Err(self.report(client_id, RelayError::RoomNotFound(room_id.to_string())));
        };

        let already_member = room.is_member(client_id);
        if !already_member {
            room.members.push(client_id.to_string());
        }

        self.send_to(
            client_id,
            ServerMessage::RoomJoined {
                room_id: room.id.clone(),
                client_id: client_id.to_string(),
                files: room.files.clone(),
                users: room.members.clone(),
            },
        );

        if !already_member {
            let joined = ServerMessage::UserJoined {
                peer_id: client_id.to_string(),
                user_count: room.members.len(),
            };
            for member in room.members.iter().filter(|m| *m != client_id) {
                self.send_to(member, joined.clone());
            }
            info!(
                room_id = %room_id,
                client_id = %client_id,
                members = room.members.len(),
                "client joined room"
            );
        }

        if let Some(mut client) = self.clients.get_mut(client_id) {
            client.rooms.insert(room_id.to_string());
        }
        Ok(())
    }

    pub fn leave_room(&self, client_id: &str, room_id: &str) -> Result<(), RelayError> {
        let was_member = self
            .clients
            .get_mut(client_id)
            .map(|mut client| client.rooms.remove(room_id))
            .unwrap_or(false);

        if !was_member {
            return Err(RelayError::NotAMember {
                room_id: room_id.to_string(),
                client_id: client_id.to_string(),
            });
        }

        self.remove_member(room_id, client_id);
        Ok(())
    }

    /// Append a stamped descriptor and broadcast it to every member, announcer included
    pub fn announce_file(
        &self,
        client_id: &str,
        room_id: &str,
        info: FileInfo,
    ) -> Result<SharedFile, RelayError> {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return Err(RelayError::RoomNotFound(room_id.to_string()));
        };

        if !room.is_member(client_id) {
            return Err(RelayError::NotAMember {
                room_id: room_id.to_string(),
                client_id: client_id.to_string(),
            });
        }

        let shared = SharedFile {
            info,
            shared_by: client_id.to_string(),
            timestamp: now_millis(),
            id: Uuid::new_v4().to_string(),
        };
        room.files.push(shared.clone());

        let event = ServerMessage::NewFile(shared.clone());
        for member in room.members.iter() {
            self.send_to(member, event.clone());
        }
        debug!(
            room_id = %room_id,
            client_id = %client_id,
            file = %shared.info.name,
            "file announced"
        );
        Ok(shared)
    }

    /// Forward a signal to `target`. Returns false when it was not delivered;
    /// the sender is not told, its negotiation will time out on its own.
    ///
    /// The pair is recorded before delivery so a `disconnect` of either side
    /// racing this call still finds the other and sends `peer-left`.
    pub fn relay_signal(&self, from: &str, target: &str, signal: Value) -> bool {
        if let Some(mut client) = self.clients.get_mut(from) {
            client.peers.insert(target.to_string());
        }
        let target_present = match self.clients.get_mut(target) {
            Some(mut client) => {
                client.peers.insert(from.to_string());
                true
            }
            None => false,
        };

        if !target_present {
            if let Some(mut client) = self.clients.get_mut(from) {
                client.peers.remove(target);
            }
            debug!(
                from = %from,
                target = %target,
                code = %ErrorCode::SignalDeliveryMiss,
                "signal dropped, target not connected"
            );
            return false;
        }

        let delivered = self.send_to(
            target,
            ServerMessage::Signal {
                user_id: from.to_string(),
                signal,
            },
        );
        if !delivered {
            debug!(
                from = %from,
                target = %target,
                code = %ErrorCode::SignalDeliveryMiss,
                "signal dropped, target queue unavailable"
            );
        }
        delivered
    }

    /// Record locally observed addresses and reply with clients behind the
    /// same external address
    pub fn announce_presence(
        &self,
        client_id: &str,
        local_addresses: Vec<String>,
    ) -> Result<Vec<ClientId>, RelayError> {
        let public_address = {
            let mut client = self
                .clients
                .get_mut(client_id)
                .ok_or_else(|| RelayError::UnknownClient(client_id.to_string()))?;
            client.local_addresses = local_addresses;
            client.public_address
        };

        let peers: Vec<ClientId> = match public_address {
            Some(addr) => self
                .clients
                .iter()
                .filter(|c| c.key() != client_id && c.public_address == Some(addr))
                .map(|c| c.key().clone())
                .collect(),
            None => Vec::new(),
        };

        self.send_to(
            client_id,
            ServerMessage::NearbyPeers {
                peers: peers.clone(),
            },
        );
        Ok(peers)
    }

    /// Transport-level close: leave every room, tell signalling partners
    pub fn disconnect(&self, client_id: &str) {
        let Some((_, entry)) = self.clients.remove(client_id) else {
            return;
        };

        let mut notified: HashSet<ClientId> = HashSet::new();
        for room_id in entry.rooms.iter() {
            notified.extend(self.remove_member(room_id, client_id));
        }

        for peer in entry.peers.iter() {
            if let Some(mut client) = self.clients.get_mut(peer) {
                client.peers.remove(client_id);
            }
            if !notified.contains(peer) {
                self.send_to(
                    peer,
                    ServerMessage::PeerLeft {
                        peer_id: client_id.to_string(),
                    },
                );
            }
        }
        info!(
            client_id = %client_id,
            rooms = entry.rooms.len(),
            clients = self.clients.len(),
            "client disconnected"
        );
    }

    /// Delete rooms older than `max_age`. Returns how many were removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut expired: Vec<(RoomId, Vec<ClientId>)> = Vec::new();

        self.rooms.retain(|room_id, room| {
            if now.duration_since(room.created_at) >= max_age {
                expired.push((room_id.clone(), room.members.clone()));
                false
            } else {
                true
            }
        });

        // outside retain so no room shard is held while touching clients
        for (room_id, members) in expired.iter() {
            for member in members {
                if let Some(mut client) = self.clients.get_mut(member) {
                    client.rooms.remove(room_id);
                }
            }
            info!(room_id = %room_id, members = members.len(), "expired room deleted");
        }
        expired.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn members(&self, room_id: &str) -> Option<Vec<ClientId>> {
        self.rooms.get(room_id).map(|room| room.members.clone())
    }

    pub fn files(&self, room_id: &str) -> Option<Vec<SharedFile>> {
        self.rooms.get(room_id).map(|room| room.files.clone())
    }

    pub fn room_summary(&self, room_id: &str) -> Option<RoomSummary> {
        self.rooms.get(room_id).map(|room| RoomSummary {
            room_id: room.id.clone(),
            user_count: room.members.len(),
            files: room.files.clone(),
        })
    }

    pub fn local_addresses(&self, client_id: &str) -> Option<Vec<String>> {
        self.clients
            .get(client_id)
            .map(|client| client.local_addresses.clone())
    }

    pub fn connected_peers(&self, client_id: &str) -> Option<HashSet<ClientId>> {
        self.clients.get(client_id).map(|client| client.peers.clone())
    }

    /// Drop `client_id` from the room; deletes the room when it empties,
    /// otherwise tells the rest. Returns the remaining members.
    fn remove_member(&self, room_id: &str, client_id: &str) -> Vec<ClientId> {
        let Entry::Occupied(mut entry) = self.rooms.entry(room_id.to_string()) else {
            return Vec::new();
        };

        let room = entry.get_mut();
        let before = room.members.len();
        room.members.retain(|m| m != client_id);
        if room.members.len() == before {
            return room.members.clone();
        }

        if room.members.is_empty() {
            entry.remove();
            info!(room_id = %room_id, "room empty, deleted");
            return Vec::new();
        }

        let left = ServerMessage::UserLeft {
            peer_id: client_id.to_string(),
            user_count: room.members.len(),
        };
        for member in room.members.iter() {
            self.send_to(member, left.clone());
        }
        room.members.clone()
    }

    /// Send the client-visible form of `err` to `client_id`, if it has one
    fn report(&self, client_id: &str, err: RelayError) -> RelayError {
        if let Some(code) = err.code() {
            self.send_to(
                client_id,
                ServerMessage::Error {
                    message: err.to_string(),
                    code,
                },
            );
        }
        err
    }

    fn send_to(&self, client_id: &str, msg: ServerMessage) -> bool {
        let Some(client) = self.clients.get(client_id) else {
            return false;
        };
        let event = msg.event_name();
        match client.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(client_id = %client_id, event, "client queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(client_id = %client_id, event, "client queue closed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const QUEUE: usize = 64;

    struct TestClient {
        id: ClientId,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        fn connect(registry: &RoomRegistry) -> Self {
            Self::connect_from(registry, None)
        }

        fn connect_from(registry: &RoomRegistry, addr: Option<IpAddr>) -> Self {
            let (tx, mut rx) = mpsc::channel(QUEUE);
            let id = registry.register_client(tx, addr);
            // swallow greeting
            assert!(matches!(rx.try_recv(), Ok(ServerMessage::Connected { .. })));
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn member_set(registry: &RoomRegistry, room_id: &str) -> BTreeSet<ClientId> {
        registry
            .members(room_id)
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    #[test]
    fn create_then_join_notifies_both_sides() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let mut b = TestClient::connect(&registry);

        let room_id = registry.create_room(&a.id).unwrap();
        assert_eq!(
            a.drain(),
            vec![ServerMessage::RoomCreated {
                room_id: room_id.clone(),
                client_id: a.id.clone()
            }]
        );

        registry.join_room(&b.id, &room_id).unwrap();

        assert_eq!(
            b.drain(),
            vec![ServerMessage::RoomJoined {
                room_id: room_id.clone(),
                client_id: b.id.clone(),
                files: vec![],
                users: vec![a.id.clone(), b.id.clone()],
            }]
        );
        assert_eq!(
            a.drain(),
            vec![ServerMessage::UserJoined {
                peer_id: b.id.clone(),
                user_count: 2
            }]
        );
    }

    #[test]
    fn join_unknown_room_is_rejected_without_mutation() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let existing = registry.create_room(&a.id).unwrap();
        a.drain();

        let err = registry.join_room(&a.id, "no-such-room").unwrap_err();

        assert_eq!(err, RelayError::RoomNotFound("no-such-room".into()));
        assert_eq!(err.code(), Some(ErrorCode::RoomNotFound));
        assert_eq!(
            a.drain(),
            vec![ServerMessage::Error {
                message: err.to_string(),
                code: ErrorCode::RoomNotFound
            }]
        );
        assert_eq!(err.to_string(), "Room not found");
        assert_eq!(registry.room_count(), 1);
        assert_eq!(member_set(&registry, &existing).len(), 1);
        assert!(!registry.contains_room("no-such-room"));
    }

    #[test]
    fn rejoin_is_idempotent() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let mut b = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();
        registry.join_room(&b.id, &room_id).unwrap();
        a.drain();
        b.drain();

        registry.join_room(&b.id, &room_id).unwrap();

        assert_eq!(registry.members(&room_id).unwrap().len(), 2);
        assert!(a.drain().is_empty(), "no second user-joined");
        assert!(matches!(b.drain()[..], [ServerMessage::RoomJoined { .. }]));
    }

    #[test]
    fn membership_tracks_joins_leaves_and_disconnects() {
        let registry = RoomRegistry::new();
        let a = TestClient::connect(&registry);
        let b = TestClient::connect(&registry);
        let c = TestClient::connect(&registry);
        let d = TestClient::connect(&registry);

        let room_id = registry.create_room(&a.id).unwrap();
        let mut expected: BTreeSet<ClientId> = [a.id.clone()].into();
        assert_eq!(member_set(&registry, &room_id), expected);

        for client in [&b, &c, &d] {
            registry.join_room(&client.id, &room_id).unwrap();
            expected.insert(client.id.clone());
            assert_eq!(member_set(&registry, &room_id), expected);
        }

        registry.leave_room(&c.id, &room_id).unwrap();
        expected.remove(&c.id);
        assert_eq!(member_set(&registry, &room_id), expected);

        registry.disconnect(&a.id);
        expected.remove(&a.id);
        assert_eq!(member_set(&registry, &room_id), expected);

        registry.join_room(&c.id, &room_id).unwrap();
        expected.insert(c.id.clone());
        assert_eq!(member_set(&registry, &room_id), expected);
    }

    #[test]
    fn disconnect_broadcasts_user_left() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let b = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();
        registry.join_room(&b.id, &room_id).unwrap();
        a.drain();

        registry.disconnect(&b.id);

        assert_eq!(
            a.drain(),
            vec![ServerMessage::UserLeft {
                peer_id: b.id.clone(),
                user_count: 1
            }]
        );
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn last_member_leaving_deletes_room_immediately() {
        let registry = RoomRegistry::new();
        let a = TestClient::connect(&registry);
        let b = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();
        registry.join_room(&b.id, &room_id).unwrap();

        registry.leave_room(&a.id, &room_id).unwrap();
        assert!(registry.contains_room(&room_id));

        registry.disconnect(&b.id);
        assert!(!registry.contains_room(&room_id));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn leaving_a_room_you_are_not_in_fails() {
        let registry = RoomRegistry::new();
        let a = TestClient::connect(&registry);
        let b = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();

        assert!(matches!(
            registry.leave_room(&b.id, &room_id),
            Err(RelayError::NotAMember { .. })
        ));
        assert_eq!(registry.members(&room_id).unwrap(), vec![a.id.clone()]);
    }

    #[test]
    fn announce_file_stamps_and_broadcasts_to_everyone() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let mut b = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();
        registry.join_room(&b.id, &room_id).unwrap();
        a.drain();
        b.drain();

        let shared = registry
            .announce_file(&a.id, &room_id, FileInfo::new("a.txt", 5, "text/plain"))
            .unwrap();

        assert_eq!(shared.shared_by, a.id);
        assert!(!shared.id.is_empty());
        assert_eq!(a.drain(), vec![ServerMessage::NewFile(shared.clone())]);
        assert_eq!(b.drain(), vec![ServerMessage::NewFile(shared.clone())]);
        assert_eq!(registry.files(&room_id).unwrap(), vec![shared]);
    }

    #[test]
    fn announce_from_non_member_is_refused() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let outsider = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();
        a.drain();

        let result = registry.announce_file(&outsider.id, &room_id, FileInfo::new("x", 1, ""));

        assert!(matches!(result, Err(RelayError::NotAMember { .. })));
        assert!(registry.files(&room_id).unwrap().is_empty());
        assert!(a.drain().is_empty());
    }

    #[test]
    fn joiner_receives_existing_files() {
        let registry = RoomRegistry::new();
        let a = TestClient::connect(&registry);
        let mut b = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();
        let shared = registry
            .announce_file(&a.id, &room_id, FileInfo::new("a.txt", 5, "text/plain"))
            .unwrap();

        registry.join_room(&b.id, &room_id).unwrap();

        match &b.drain()[..] {
            [ServerMessage::RoomJoined { files, .. }] => assert_eq!(files, &vec![shared]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_announcements_lose_nothing() {
        let registry = RoomRegistry::new();
        let a = TestClient::connect(&registry);
        let b = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();
        registry.join_room(&b.id, &room_id).unwrap();

        let mut tasks = Vec::new();
        for (client_id, prefix) in [(a.id.clone(), "a"), (b.id.clone(), "b")] {
            let registry = registry.clone();
            let room_id = room_id.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    registry
                        .announce_file(&client_id, &room_id, FileInfo::new(format!("{prefix}-{i}"), i, ""))
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let files = registry.files(&room_id).unwrap();
        assert_eq!(files.len(), 100);
        for file in files {
            let expected_sender = if file.info.name.starts_with("a-") { &a.id } else { &b.id };
            assert_eq!(&file.shared_by, expected_sender);
        }
    }

    #[test]
    fn signal_is_forwarded_with_sender_id() {
        let registry = RoomRegistry::new();
        let a = TestClient::connect(&registry);
        let mut b = TestClient::connect(&registry);

        let payload = serde_json::json!({"type": "offer", "sdp": "v=0"});
        assert!(registry.relay_signal(&a.id, &b.id, payload.clone()));

        assert_eq!(
            b.drain(),
            vec![ServerMessage::Signal {
                user_id: a.id.clone(),
                signal: payload
            }]
        );
        assert!(registry.connected_peers(&a.id).unwrap().contains(&b.id));
        assert!(registry.connected_peers(&b.id).unwrap().contains(&a.id));
    }

    #[test]
    fn signal_to_missing_target_is_dropped_silently() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);

        assert!(!registry.relay_signal(&a.id, "gone", serde_json::json!({})));
        assert!(a.drain().is_empty());
        assert!(registry.connected_peers(&a.id).unwrap().is_empty());
    }

    #[test]
    fn disconnect_during_signal_delivery_still_sends_peer_left() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        // b's socket is already tearing down: queue gone, disconnect not yet run
        let TestClient { id: b, rx } = TestClient::connect(&registry);
        drop(rx);

        assert!(!registry.relay_signal(&a.id, &b, serde_json::json!({"type": "offer"})));
        registry.disconnect(&b);

        assert_eq!(a.drain(), vec![ServerMessage::PeerLeft { peer_id: b }]);
        assert!(registry.connected_peers(&a.id).unwrap().is_empty());
    }

    #[test]
    fn full_client_queue_drops_events_without_blocking() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let (tx, mut slow_rx) = mpsc::channel(2);
        let slow = registry.register_client(tx, None);

        assert!(registry.relay_signal(&a.id, &slow, serde_json::json!({"n": 1})));
        assert!(!registry.relay_signal(&a.id, &slow, serde_json::json!({"n": 2})));

        // everyone else is still served
        registry.create_room(&a.id).unwrap();
        assert!(matches!(a.drain()[..], [ServerMessage::RoomCreated { .. }]));

        assert!(matches!(slow_rx.try_recv(), Ok(ServerMessage::Connected { .. })));
        assert!(matches!(slow_rx.try_recv(), Ok(ServerMessage::Signal { .. })));
        assert!(slow_rx.try_recv().is_err());
    }

    #[test]
    fn disconnect_tells_roomless_signal_partners() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let b = TestClient::connect(&registry);
        registry.relay_signal(&b.id, &a.id, serde_json::json!({}));
        a.drain();

        registry.disconnect(&b.id);

        assert_eq!(
            a.drain(),
            vec![ServerMessage::PeerLeft {
                peer_id: b.id.clone()
            }]
        );
        assert!(registry.connected_peers(&a.id).unwrap().is_empty());
    }

    #[test]
    fn disconnect_does_not_double_notify_room_mates() {
        let registry = RoomRegistry::new();
        let mut a = TestClient::connect(&registry);
        let b = TestClient::connect(&registry);
        let room_id = registry.create_room(&a.id).unwrap();
        registry.join_room(&b.id, &room_id).unwrap();
        registry.relay_signal(&b.id, &a.id, serde_json::json!({}));
        a.drain();

        registry.disconnect(&b.id);

        let events = a.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerMessage::UserLeft { .. }));
    }

    #[test]
    fn presence_groups_clients_by_public_address() {
        let registry = RoomRegistry::new();
        let home: IpAddr = "203.0.113.7".parse().unwrap();
        let elsewhere: IpAddr = "198.51.100.1".parse().unwrap();
        let mut a = TestClient::connect_from(&registry, Some(home));
        let b = TestClient::connect_from(&registry, Some(home));
        let _c = TestClient::connect_from(&registry, Some(elsewhere));

        let peers = registry
            .announce_presence(&a.id, vec!["192.168.1.10".into()])
            .unwrap();

        assert_eq!(peers, vec![b.id.clone()]);
        assert_eq!(
            a.drain(),
            vec![ServerMessage::NearbyPeers {
                peers: vec![b.id.clone()]
            }]
        );
        assert_eq!(
            registry.local_addresses(&a.id).unwrap(),
            vec!["192.168.1.10".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_rooms() {
        let registry = RoomRegistry::new();
        let a = TestClient::connect(&registry);
        let old_room = registry.create_room(&a.id).unwrap();

        tokio::time::advance(Duration::from_secs(100)).await;
        let fresh_room = registry.create_room(&a.id).unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        let removed = registry.sweep(Duration::from_secs(120));

        assert_eq!(removed, 1);
        assert!(!registry.contains_room(&old_room));
        assert!(registry.contains_room(&fresh_room));

        // the stale room id no longer belongs to the client
        assert!(matches!(
            registry.leave_room(&a.id, &old_room),
            Err(RelayError::NotAMember { .. })
        ));
    }
}
