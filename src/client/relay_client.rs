use crate::common::{ClientId, FileInfo, RoomId};
use crate::relay::protocol::{ClientMessage, ServerMessage};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// WebSocket connection to a relay.
///
/// Requests are queued and written by a background task; relay events come
/// out of the receiver returned by [`RelayClient::connect`]. Clones share
/// the same connection.
#[derive(Clone)]
pub struct RelayClient {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    closed: CancellationToken,
}

impl RelayClient {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to relay at {url}"))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let token = closed.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    msg = outgoing_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode relay request");
                        continue;
                    }
                };
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let token = closed.clone();
        tokio::spawn(async move {
            // either side ending takes the writer down too
            let _guard = token.clone().drop_guard();
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    msg = read.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(event) => {
                            debug!(event = event.event_name(), "relay event");
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "unrecognized relay event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "relay socket error");
                        break;
                    }
                }
            }
            debug!("relay connection closed");
        });

        Ok((Self { outgoing, closed }, events))
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.outgoing
            .send(msg)
            .map_err(|_| anyhow::anyhow!("relay connection closed"))
    }

    pub fn create_room(&self) -> Result<()> {
        self.send(ClientMessage::CreateRoom)
    }

    pub fn join_room(&self, room_id: &RoomId) -> Result<()> {
        self.send(ClientMessage::JoinRoom(room_id.clone()))
    }

    pub fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        self.send(ClientMessage::LeaveRoom(room_id.clone()))
    }

    pub fn share_file(&self, room_id: &RoomId, file_info: FileInfo) -> Result<()> {
        self.send(ClientMessage::FileShared {
            room_id: room_id.clone(),
            file_info,
        })
    }

    pub fn signal(&self, target: &ClientId, signal: Value) -> Result<()> {
        self.send(ClientMessage::Signal {
            user_id: target.clone(),
            signal,
        })
    }

    pub fn announce_presence(&self, local_addresses: Vec<String>) -> Result<()> {
        self.send(ClientMessage::AnnouncePresence { local_addresses })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outgoing.is_closed()
    }

    /// Close the socket for every clone of this client
    pub fn close(&self) {
        self.closed.cancel();
    }
}
