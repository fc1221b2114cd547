use crate::common::{ClientId, SessionError};
use crate::peer::transport::PeerState;
use crate::transfer::TransferEvent;
use tokio::sync::mpsc;

/// Everything sessions report to the application, through one channel
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged { peer_id: ClientId, state: PeerState },
    ConnectionFailed { peer_id: ClientId, error: SessionError },
    Transfer { peer_id: ClientId, event: TransferEvent },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerEvent::StateChanged { peer_id, .. }
            | PeerEvent::ConnectionFailed { peer_id, .. }
            | PeerEvent::Transfer { peer_id, .. } => peer_id,
        }
    }
}

/// Per-session handle on the event sink
#[derive(Clone)]
pub struct EventReporter {
    peer_id: ClientId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl EventReporter {
    pub fn new(peer_id: ClientId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { peer_id, tx }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self, state: PeerState) {
        self.emit(PeerEvent::StateChanged {
            peer_id: self.peer_id.clone(),
            state,
        });
    }

    pub fn failed(&self, error: SessionError) {
        self.emit(PeerEvent::ConnectionFailed {
            peer_id: self.peer_id.clone(),
            error,
        });
    }

    pub fn transfer(&self, event: TransferEvent) {
        self.emit(PeerEvent::Transfer {
            peer_id: self.peer_id.clone(),
            event,
        });
    }

    // nobody listening is fine
    fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(event);
    }
}
