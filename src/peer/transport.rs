//! Negotiation transport abstraction
//!
//! Traits the session manager drives to negotiate a peer connection and move
//! frames over its data channel. Implemented by the in-memory loopback network
//! and, behind the `webrtc` feature, by a WebRTC adapter.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Label of the single data channel opened per peer
pub const CHANNEL_LABEL: &str = "fileTransfer";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Negotiation error: {0}")]
    Negotiation(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Channel closed")]
    Closed,
}

/// One message on a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a connection reports back to its session, in order
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen(Arc<dyn DataChannel>),
    Message(Frame),
    ChannelClosed,
    Failed(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            TransportEvent::Message(frame) => f.debug_tuple("Message").field(&frame.len()).finish(),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// Creates one negotiation context per remote peer
#[async_trait]
pub trait NegotiationTransport: Send + Sync {
    /// New connection towards `peer_id`. All of its events go to `events`.
    async fn connect(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>, TransportError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Initiator side: request the data channel before creating the offer
    async fn create_channel(&self, label: &str) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Responder side: apply the remote offer and produce an answer
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Bytes queued but not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    fn low_water_mark(&self) -> usize;

    /// Resolves when the buffered amount drops to the low-water mark.
    /// Notifications may be missed, callers re-check `buffered_amount`.
    async fn buffered_amount_low(&self);

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Payload of a relayed `signal` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signal {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Idle,
    Negotiating,
    Open,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn browser_descriptions_parse() {
        let signal: Signal =
            serde_json::from_value(json!({"type": "answer", "sdp": "v=0\r\n"})).unwrap();
        assert_eq!(signal, Signal::Description(SessionDescription::answer("v=0\r\n")));
    }

    #[test]
    fn browser_candidates_parse() {
        let signal: Signal = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 192.168.1.4 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        }))
        .unwrap();

        match signal {
            Signal::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_payload_is_rejected() {
        assert!(serde_json::from_value::<Signal>(json!({"type": "pranswer"})).is_err());
    }
}
