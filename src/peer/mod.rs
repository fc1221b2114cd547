//! Peer sessions: one negotiation state machine per remote client.
//!
//! The relay only carries `signal` payloads; everything here runs on the
//! clients. A [`PeerSessionManager`] owns the sessions and routes relay
//! events to them, the transport traits abstract the actual connection.

pub mod events;
pub mod loopback;
pub mod manager;
pub mod session;
pub mod transport;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use events::{EventReporter, PeerEvent};
pub use loopback::LoopbackNetwork;
pub use manager::{ManagerChannels, PeerSessionManager};
pub use session::OutboundSignal;
pub use transport::{
    DataChannel, Direction, Frame, IceCandidate, NegotiationTransport, PeerConnection, PeerState,
    SessionDescription, Signal, TransportError, TransportEvent, CHANNEL_LABEL,
};
