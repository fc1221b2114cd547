//! One task per remote peer.
//!
//! The task owns the negotiation context, the data channel once open, and the
//! transfer engine. It is driven by commands from the manager and by events from
//! its connection, and reports through the shared [`EventReporter`] sink.

use crate::common::{ClientId, FileInfo, SessionError, TransferConfig};
use crate::peer::events::{EventReporter, PeerEvent};
use crate::peer::transport::{
    Direction, IceCandidate, NegotiationTransport, PeerConnection, PeerState, SdpKind,
    SessionDescription, Signal, TransportError, TransportEvent, CHANNEL_LABEL,
};
use crate::transfer::{FileLibrary, FileSource, OutgoingTransfer, TransferEngine, TransferId};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often undecided incoming offers are checked for expiry
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// A signal the session wants relayed to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub target: ClientId,
    pub signal: Signal,
}

pub type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub enum SessionCommand {
    Signal(Signal),
    SendFile {
        info: FileInfo,
        source: FileSource,
        reply: Reply<OutgoingTransfer>,
    },
    Respond {
        transfer_id: TransferId,
        accept: bool,
        reply: Reply<()>,
    },
    RequestFiles {
        names: Vec<String>,
        reply: Reply<()>,
    },
    Close,
}

pub struct SessionParams {
    pub peer_id: ClientId,
    pub local_id: Option<ClientId>,
    pub direction: Direction,
    pub transport: Arc<dyn NegotiationTransport>,
    pub signals: mpsc::UnboundedSender<OutboundSignal>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub library: FileLibrary,
    pub config: TransferConfig,
}

/// Manager-side handle of a running session
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<PeerState>,
}

impl SessionHandle {
    pub fn send(&self, peer_id: &str, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed(peer_id.to_string()))
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<PeerState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PeerState::Closed || self.commands.is_closed()
    }
}

pub fn spawn(params: SessionParams) -> SessionHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(PeerState::Idle);
    // replaced by the real stream once the connection exists
    let (_, transport_events) = mpsc::unbounded_channel();

    let session = PeerSession {
        reporter: EventReporter::new(params.peer_id.clone(), params.events),
        peer_id: params.peer_id,
        local_id: params.local_id,
        direction: params.direction,
        transport: params.transport,
        signals: params.signals,
        library: params.library,
        config: params.config,
        state: state_tx,
        connection: None,
        transport_events,
        engine: None,
        remote_description_set: false,
        pending_candidates: Vec::new(),
        cancel: CancellationToken::new(),
    };
    tokio::spawn(session.run(command_rx));

    SessionHandle {
        commands,
        state: state_rx,
    }
}

struct PeerSession {
    peer_id: ClientId,
    local_id: Option<ClientId>,
    direction: Direction,
    transport: Arc<dyn NegotiationTransport>,
    signals: mpsc::UnboundedSender<OutboundSignal>,
    reporter: EventReporter,
    library: FileLibrary,
    config: TransferConfig,
    state: watch::Sender<PeerState>,
    connection: Option<Box<dyn PeerConnection>>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    engine: Option<TransferEngine>,
    remote_description_set: bool,
    /// Remote candidates that arrived before the remote description
    pending_candidates: Vec<IceCandidate>,
    cancel: CancellationToken,
}

impl PeerSession {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        debug!(peer_id = %self.peer_id, direction = ?self.direction, "peer session started");

        if let Err(error) = self.start().await {
            self.fail(error);
            self.teardown().await;
            return;
        }

        let deadline = tokio::time::sleep(self.config.negotiation_timeout());
        tokio::pin!(deadline);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let negotiating = matches!(self.current_state(), PeerState::Idle | PeerState::Negotiating);

            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => ControlFlow::Break(()),
                    Some(command) => self.handle_command(command).await,
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        debug!(peer_id = %self.peer_id, "transport event stream ended");
                        ControlFlow::Break(())
                    }
                },
                _ = &mut deadline, if negotiating => {
                    self.fail(SessionError::NegotiationTimeout(self.peer_id.clone()));
                    ControlFlow::Break(())
                },
                _ = housekeeping.tick() => {
                    if let Some(engine) = self.engine.as_mut() {
                        engine.expire_offers();
                    }
                    ControlFlow::Continue(())
                },
            };

            if flow.is_break() {
                break;
            }
        }

        self.teardown().await;
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        self.open_connection().await?;
        if self.direction == Direction::Initiator {
            self.send_offer().await?;
        }
        Ok(())
    }

    async fn open_connection(&mut self) -> Result<(), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = self
            .transport
            .connect(&self.peer_id, tx)
            .await
            .map_err(|e| self.negotiation_error(e))?;
        self.connection = Some(connection);
        self.transport_events = rx;
        self.remote_description_set = false;
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<(), SessionError> {
        self.set_state(PeerState::Negotiating);
        let connection = self.connection()?;
        connection
            .create_channel(CHANNEL_LABEL)
            .await
            .map_err(|e| self.negotiation_error(e))?;
        let offer = connection
            .create_offer()
            .await
            .map_err(|e| self.negotiation_error(e))?;
        self.send_signal(Signal::Description(offer));
        Ok(())
    }

    async fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Signal(signal) => return self.handle_signal(signal).await,
            SessionCommand::SendFile {
                info,
                source,
                reply,
            } => {
                let result = match self.engine.as_ref() {
                    Some(engine) => Ok(engine.start_send(info, source)),
                    None => Err(SessionError::NotOpen(self.peer_id.clone())),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Respond {
                transfer_id,
                accept,
                reply,
            } => {
                let result = match self.engine.as_mut() {
                    Some(engine) => engine
                        .respond(transfer_id, accept)
                        .await
                        .map_err(SessionError::from),
                    None => Err(SessionError::NotOpen(self.peer_id.clone())),
                };
                let _ = reply.send(result);
            }
            SessionCommand::RequestFiles { names, reply } => {
                let result = match self.engine.as_ref() {
                    Some(engine) => engine.request_files(names).await.map_err(SessionError::from),
                    None => Err(SessionError::NotOpen(self.peer_id.clone())),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Close => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn handle_signal(&mut self, signal: Signal) -> ControlFlow<()> {
        match signal {
            Signal::Description(desc) => match desc.kind {
                SdpKind::Offer => self.on_offer(desc).await,
                SdpKind::Answer => self.on_answer(desc).await,
            },
            Signal::Candidate(candidate) => {
                if self.remote_description_set {
                    self.apply_candidate(candidate).await;
                } else {
                    self.pending_candidates.push(candidate);
                }
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> ControlFlow<()> {
        if matches!(self.current_state(), PeerState::Open | PeerState::Closed) {
            debug!(peer_id = %self.peer_id, "offer on established session ignored");
            return ControlFlow::Continue(());
        }

        if self.direction == Direction::Initiator {
            if !self.yields_on_glare() {
                debug!(peer_id = %self.peer_id, "glare: keeping our own offer");
                return ControlFlow::Continue(());
            }

            info!(peer_id = %self.peer_id, "glare: yielding, answering remote offer");
            if let Some(connection) = self.connection.take() {
                connection.close().await;
            }
            self.direction = Direction::Responder;
            if let Err(error) = self.open_connection().await {
                self.fail(error);
                return ControlFlow::Break(());
            }
        }

        let answer = match self.connection() {
            Ok(connection) => connection.accept_offer(offer).await,
            Err(error) => {
                self.fail(error);
                return ControlFlow::Break(());
            }
        };

        match answer {
            Ok(answer) => {
                self.set_state(PeerState::Negotiating);
                self.send_signal(Signal::Description(answer));
                self.remote_description_set = true;
                self.flush_candidates().await;
                ControlFlow::Continue(())
            }
            Err(e) => {
                let error = self.negotiation_error(e);
                self.fail(error);
                ControlFlow::Break(())
            }
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> ControlFlow<()> {
        if self.direction != Direction::Initiator
            || self.remote_description_set
            || self.current_state() != PeerState::Negotiating
        {
            debug!(peer_id = %self.peer_id, "unexpected answer ignored");
            return ControlFlow::Continue(());
        }

        let applied = match self.connection() {
            Ok(connection) => connection.accept_answer(answer).await,
            Err(error) => {
                self.fail(error);
                return ControlFlow::Break(());
            }
        };

        match applied {
            Ok(()) => {
                self.remote_description_set = true;
                self.flush_candidates().await;
                ControlFlow::Continue(())
            }
            Err(e) => {
                let error = self.negotiation_error(e);
                self.fail(error);
                ControlFlow::Break(())
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(peer_id = %self.peer_id, count = pending.len(), "applying buffered candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    // a bad candidate only narrows the paths tried, it never ends the session
    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Some(connection) = self.connection.as_deref() {
            if let Err(e) = connection.add_candidate(candidate).await {
                warn!(peer_id = %self.peer_id, error = %e, "remote candidate rejected");
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> ControlFlow<()> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send_signal(Signal::Candidate(candidate));
            }
            TransportEvent::ChannelOpen(channel) => {
                if self.engine.is_some() {
                    debug!(peer_id = %self.peer_id, "second channel ignored");
                    return ControlFlow::Continue(());
                }
                info!(peer_id = %self.peer_id, label = %channel.label(), "data channel open");
                self.engine = Some(TransferEngine::new(
                    channel,
                    self.config.clone(),
                    self.library.clone(),
                    self.reporter.clone(),
                    self.cancel.child_token(),
                ));
                self.set_state(PeerState::Open);
            }
            TransportEvent::Message(frame) => match self.engine.as_mut() {
                Some(engine) => engine.handle_frame(frame).await,
                None => debug!(peer_id = %self.peer_id, "frame before channel open dropped"),
            },
            TransportEvent::ChannelClosed => {
                info!(peer_id = %self.peer_id, "data channel closed by peer");
                return ControlFlow::Break(());
            }
            TransportEvent::Failed(reason) => {
                if self.current_state() != PeerState::Open {
                    self.fail(SessionError::NegotiationFailed {
                        peer_id: self.peer_id.clone(),
                        reason,
                    });
                } else {
                    warn!(peer_id = %self.peer_id, reason = %reason, "connection failed");
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(mut engine) = self.engine.take() {
            engine.abandon_all();
            engine.channel().close().await;
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.set_state(PeerState::Closed);
        info!(peer_id = %self.peer_id, "peer session closed");
    }

    /// Lower client id yields when both sides offered at once
    fn yields_on_glare(&self) -> bool {
        match self.local_id.as_deref() {
            Some(local) => local < self.peer_id.as_str(),
            None => true,
        }
    }

    fn connection(&self) -> Result<&dyn PeerConnection, SessionError> {
        self.connection
            .as_deref()
            .ok_or_else(|| SessionError::Closed(self.peer_id.clone()))
    }

    fn send_signal(&self, signal: Signal) {
        let outbound = OutboundSignal {
            target: self.peer_id.clone(),
            signal,
        };
        if self.signals.send(outbound).is_err() {
            debug!(peer_id = %self.peer_id, "signal sink closed");
        }
    }

    fn current_state(&self) -> PeerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: PeerState) {
        if self.current_state() == state {
            return;
        }
        self.state.send_replace(state);
        debug!(peer_id = %self.peer_id, state = ?state, "peer state");
        self.reporter.state(state);
    }

    fn negotiation_error(&self, error: TransportError) -> SessionError {
        SessionError::NegotiationFailed {
            peer_id: self.peer_id.clone(),
            reason: error.to_string(),
        }
    }

    fn fail(&self, error: SessionError) {
        warn!(
            peer_id = %self.peer_id,
            code = ?error.code(),
            error = %error,
            "peer session failed"
        );
        self.reporter.failed(error);
    }
}
