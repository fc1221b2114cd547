use crate::common::{AppError, ClientId, Config, RelayError};
use crate::relay::protocol::{ClientMessage, ServerMessage};
use crate::relay::registry::{RoomRegistry, RoomSummary};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::response::{IntoResponse, Json, Response};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct RelayState {
    pub registry: RoomRegistry,
    pub config: Arc<Config>,
}

impl RelayState {
    pub fn new(registry: RoomRegistry, config: Config) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<RelayState>,
) -> Response {
    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    let queue = state.config.relay.client_queue();
    ws.on_upgrade(move |socket| handle_socket(socket, remote, state.registry, queue))
}

/// Drive one client connection until either side closes
async fn handle_socket(
    socket: WebSocket,
    remote: Option<SocketAddr>,
    registry: RoomRegistry,
    queue: usize,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(queue);

    let client_id = registry.register_client(tx, remote.map(|addr| addr.ip()));
    debug!(client_id = %client_id, remote = ?remote, "websocket connected");

    // single writer per socket, so events for one client stay ordered
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode relay event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&registry, &client_id, &text),
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                warn!(client_id = %client_id, "binary frame on relay socket ignored");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "websocket read failed");
                break;
            }
        }
    }

    registry.disconnect(&client_id);
    writer.abort();
}

/// Apply one client message to the registry
pub fn dispatch(registry: &RoomRegistry, client_id: &ClientId, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "malformed relay message");
            return;
        }
    };

    let result = match msg {
        ClientMessage::CreateRoom => registry.create_room(client_id).map(|_| ()),
        ClientMessage::JoinRoom(room_id) => registry.join_room(client_id, &room_id),
        ClientMessage::LeaveRoom(room_id) => registry.leave_room(client_id, &room_id),
        ClientMessage::FileShared { room_id, file_info } => registry
            .announce_file(client_id, &room_id, file_info)
            .map(|_| ()),
        ClientMessage::Signal { user_id, signal } => {
            registry.relay_signal(client_id, &user_id, signal);
            Ok(())
        }
        ClientMessage::AnnouncePresence { local_addresses } => registry
            .announce_presence(client_id, local_addresses)
            .map(|_| ()),
    };

    match result {
        Ok(()) => {}
        // already reported to the client by the registry
        Err(e @ RelayError::RoomNotFound(_)) => {
            debug!(client_id = %client_id, error = %e, "relay request refused");
        }
        Err(e) => warn!(client_id = %client_id, error = %e, "relay request ignored"),
    }
}

pub async fn room_summary(
    Path(room_id): Path<String>,
    State(state): State<RelayState>,
) -> Result<Json<RoomSummary>, AppError> {
    Uuid::parse_str(&room_id).map_err(|_| AppError::BadRequest("Invalid room id".into()))?;

    state
        .registry
        .room_summary(&room_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Room not found".into()))
}

pub async fn health() -> impl IntoResponse {
    "OK"
}
