//! Relay wire messages.
//!
//! Every WebSocket text frame carries one JSON object `{"event": ..., "data": ...}`.
//! Signal payloads are relayed verbatim and never inspected by the relay.

use crate::common::{ClientId, ErrorCode, FileInfo, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A file descriptor after the relay stamped it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    #[serde(flatten)]
    pub info: FileInfo,
    pub shared_by: ClientId,
    pub timestamp: u64,
    pub id: String,
}

/// client → relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    CreateRoom,
    JoinRoom(RoomId),
    LeaveRoom(RoomId),
    #[serde(rename_all = "camelCase")]
    FileShared {
        room_id: RoomId,
        file_info: FileInfo,
    },
    /// `user_id` is the target client
    #[serde(rename_all = "camelCase")]
    Signal { user_id: ClientId, signal: Value },
    #[serde(rename_all = "camelCase")]
    AnnouncePresence {
        #[serde(default)]
        local_addresses: Vec<String>,
    },
}

/// relay → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected { client_id: ClientId },
    #[serde(rename_all = "camelCase")]
    RoomCreated { room_id: RoomId, client_id: ClientId },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: RoomId,
        client_id: ClientId,
        files: Vec<SharedFile>,
        users: Vec<ClientId>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined { peer_id: ClientId, user_count: usize },
    NewFile(SharedFile),
    /// `user_id` is the sender
    #[serde(rename_all = "camelCase")]
    Signal { user_id: ClientId, signal: Value },
    #[serde(rename_all = "camelCase")]
    UserLeft { peer_id: ClientId, user_count: usize },
    /// A connected peer that shared no room with us went away
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: ClientId },
    NearbyPeers { peers: Vec<ClientId> },
    Error { message: String, code: ErrorCode },
}

impl ServerMessage {
    /// Event name as it appears on the wire, for logging
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::RoomCreated { .. } => "room-created",
            ServerMessage::RoomJoined { .. } => "room-joined",
            ServerMessage::UserJoined { .. } => "user-joined",
            ServerMessage::NewFile(_) => "new-file",
            ServerMessage::Signal { .. } => "signal",
            ServerMessage::UserLeft { .. } => "user-left",
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::NearbyPeers { .. } => "nearby-peers",
            ServerMessage::Error { .. } => "error",
        }
    }
}
