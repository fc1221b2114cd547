use crate::common::{ClientId, FileInfo, SessionError, TransferConfig};
use crate::peer::events::PeerEvent;
use crate::peer::session::{self, OutboundSignal, SessionCommand, SessionHandle, SessionParams};
use crate::peer::transport::{Direction, NegotiationTransport, PeerState, SdpKind, Signal};
use crate::relay::protocol::ServerMessage;
use crate::transfer::{FileLibrary, FileSource, OutgoingTransfer, TransferId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Receiving ends handed to whoever drives the manager
pub struct ManagerChannels {
    /// Signals to forward through the relay
    pub signals: mpsc::UnboundedReceiver<OutboundSignal>,
    /// State changes, failures and transfer events of every session
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Owns one session per remote peer.
/// Cheap to clone; all clones share the same sessions.
#[derive(Clone)]
pub struct PeerSessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    local_id: watch::Sender<Option<ClientId>>,
    sessions: DashMap<ClientId, SessionHandle>,
    transport: Arc<dyn NegotiationTransport>,
    signals: mpsc::UnboundedSender<OutboundSignal>,
    events: mpsc::UnboundedSender<PeerEvent>,
    library: FileLibrary,
    config: TransferConfig,
}

impl PeerSessionManager {
    pub fn new(
        transport: Arc<dyn NegotiationTransport>,
        library: FileLibrary,
        config: TransferConfig,
    ) -> (Self, ManagerChannels) {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (local_id, _) = watch::channel(None);

        let manager = Self {
            inner: Arc::new(ManagerInner {
                local_id,
                sessions: DashMap::new(),
                transport,
                signals: signals_tx,
                events: events_tx,
                library,
                config,
            }),
        };
        (manager, ManagerChannels { signals, events })
    }

    /// Our relay-assigned id, used for glare resolution
    pub fn set_local_id(&self, client_id: ClientId) {
        self.inner.local_id.send_replace(Some(client_id));
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.inner.local_id.borrow().clone()
    }

    pub fn library(&self) -> &FileLibrary {
        &self.inner.library
    }

    /// Start negotiating with `peer_id` as initiator.
    /// A live session to the same peer is kept as is.
    pub fn connect(&self, peer_id: &str) -> Result<(), SessionError> {
        if self.local_id().as_deref() == Some(peer_id) {
            return Err(SessionError::UnknownPeer(peer_id.to_string()));
        }

        match self.inner.sessions.entry(peer_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    entry.insert(self.spawn_session(peer_id, Direction::Initiator));
                } else {
                    debug!(peer_id, "session already exists");
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn_session(peer_id, Direction::Initiator));
            }
        }
        Ok(())
    }

    /// Route a relayed signal from `from` to its session.
    /// An offer from an unknown peer starts a responder session.
    pub fn handle_signal(&self, from: &str, payload: Value) {
        let signal: Signal = match serde_json::from_value(payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(peer_id = from, error = %e, "malformed signal dropped");
                return;
            }
        };

        let is_offer = matches!(&signal, Signal::Description(desc) if desc.kind == SdpKind::Offer);

        match self.inner.sessions.entry(from.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    let _ = entry.get().send(from, SessionCommand::Signal(signal));
                } else if is_offer {
                    let handle = self.spawn_session(from, Direction::Responder);
                    let _ = handle.send(from, SessionCommand::Signal(signal));
                    entry.insert(handle);
                } else {
                    debug!(peer_id = from, "signal for closed session dropped");
                }
            }
            Entry::Vacant(entry) => {
                if is_offer {
                    let handle = self.spawn_session(from, Direction::Responder);
                    let _ = handle.send(from, SessionCommand::Signal(signal));
                    entry.insert(handle);
                } else {
                    debug!(peer_id = from, "signal for unknown peer dropped");
                }
            }
        }
    }

    /// Apply one relay event to the session set
    pub fn handle_relay_message(&self, message: &ServerMessage) {
        match message {
            ServerMessage::Connected { client_id }
            | ServerMessage::RoomCreated { client_id, .. }
            | ServerMessage::RoomJoined { client_id, .. } => {
                if self.local_id().as_ref() != Some(client_id) {
                    info!(client_id = %client_id, "relay assigned client id");
                    self.set_local_id(client_id.clone());
                }
            }
            ServerMessage::UserJoined { peer_id, .. } => {
                if let Err(e) = self.connect(peer_id) {
                    debug!(peer_id = %peer_id, error = %e, "not connecting");
                }
            }
            ServerMessage::Signal { user_id, signal } => {
                self.handle_signal(user_id, signal.clone());
            }
            ServerMessage::UserLeft { peer_id, .. } | ServerMessage::PeerLeft { peer_id } => {
                self.close(peer_id);
            }
            other => debug!(event = other.event_name(), "relay event not handled by peers"),
        }
    }

    /// Close and forget the session with `peer_id`
    pub fn close(&self, peer_id: &str) {
        if let Some((_, handle)) = self.inner.sessions.remove(peer_id) {
            debug!(peer_id, "closing session");
            let _ = handle.send(peer_id, SessionCommand::Close);
        }
    }

    /// Close every session and wait until all of them finished tearing down
    pub async fn shutdown(&self) {
        let peers: Vec<ClientId> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        let mut watchers = Vec::with_capacity(peers.len());

        for peer_id in peers {
            if let Some((_, handle)) = self.inner.sessions.remove(&peer_id) {
                watchers.push(handle.watch());
                let _ = handle.send(&peer_id, SessionCommand::Close);
            }
        }

        for mut state in watchers {
            // errors only when the session task is already gone
            let _ = state.wait_for(|s| *s == PeerState::Closed).await;
        }
    }

    /// Offer one file to `peer_id`. The channel must be open.
    pub async fn send_file(
        &self,
        peer_id: &str,
        info: FileInfo,
        source: FileSource,
    ) -> Result<OutgoingTransfer, SessionError> {
        self.request(peer_id, |reply| SessionCommand::SendFile {
            info,
            source,
            reply,
        })
        .await
    }

    /// Share a file with every peer whose channel is open, and keep it in the
    /// library for later `request_files`
    pub async fn send_file_to_all(
        &self,
        info: FileInfo,
        source: FileSource,
    ) -> Vec<(ClientId, Result<OutgoingTransfer, SessionError>)> {
        self.inner.library.insert(info.clone(), source.clone());

        let mut results = Vec::new();
        for peer_id in self.open_peers() {
            let result = self.send_file(&peer_id, info.clone(), source.clone()).await;
            results.push((peer_id, result));
        }
        results
    }

    /// Accept or reject an incoming offer
    pub async fn respond(
        &self,
        peer_id: &str,
        transfer_id: TransferId,
        accept: bool,
    ) -> Result<(), SessionError> {
        self.request(peer_id, |reply| SessionCommand::Respond {
            transfer_id,
            accept,
            reply,
        })
        .await
    }

    /// Ask `peer_id` to send files from its library, all of them when `names` is empty
    pub async fn request_files(&self, peer_id: &str, names: Vec<String>) -> Result<(), SessionError> {
        self.request(peer_id, |reply| SessionCommand::RequestFiles { names, reply })
            .await
    }

    pub fn state(&self, peer_id: &str) -> Option<PeerState> {
        self.inner.sessions.get(peer_id).map(|h| h.state())
    }

    pub fn watch_state(&self, peer_id: &str) -> Option<watch::Receiver<PeerState>> {
        self.inner.sessions.get(peer_id).map(|h| h.watch())
    }

    pub fn peers(&self) -> Vec<ClientId> {
        self.inner.sessions.iter().map(|e| e.key().clone()).collect()
    }

    fn open_peers(&self) -> Vec<ClientId> {
        self.inner
            .sessions
            .iter()
            .filter(|e| e.value().state() == PeerState::Open)
            .map(|e| e.key().clone())
            .collect()
    }

    async fn request<T>(
        &self,
        peer_id: &str,
        command: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        {
            // guard must not live across the await below
            let handle = self
                .inner
                .sessions
                .get(peer_id)
                .ok_or_else(|| SessionError::UnknownPeer(peer_id.to_string()))?;
            handle.send(peer_id, command(tx))?;
        }
        rx.await
            .map_err(|_| SessionError::Closed(peer_id.to_string()))?
    }

    fn spawn_session(&self, peer_id: &str, direction: Direction) -> SessionHandle {
        info!(peer_id, ?direction, "starting peer session");
        session::spawn(SessionParams {
            peer_id: peer_id.to_string(),
            local_id: self.local_id(),
            direction,
            transport: self.inner.transport.clone(),
            signals: self.inner.signals.clone(),
            events: self.inner.events.clone(),
            library: self.inner.library.clone(),
            config: self.inner.config.clone(),
        })
    }
}
