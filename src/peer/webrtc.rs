//! [`NegotiationTransport`] backed by the `webrtc` crate.
//!
//! Candidates trickle through `on_ice_candidate` instead of waiting for
//! gathering to complete, so browsers on the other end see the usual flow.

use crate::common::IceServer;
use crate::peer::transport::{
    DataChannel, Frame, IceCandidate, NegotiationTransport, PeerConnection, SdpKind,
    SessionDescription, TransportError, TransportEvent,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn negotiation(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<IceServer>,
    low_water_mark: usize,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<IceServer>, low_water_mark: usize) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(negotiation)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(negotiation)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers,
            low_water_mark,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl NegotiationTransport for WebRtcTransport {
    async fn connect(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(negotiation)?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!(error = %e, "local candidate not serializable"),
                }
            })
        }));

        let tx = events.clone();
        let peer = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            let peer = peer.clone();
            Box::pin(async move {
                debug!(peer_id = %peer, ?state, "peer connection state");
                if state == RTCPeerConnectionState::Failed {
                    let _ = tx.send(TransportEvent::Failed("ICE connection failed".into()));
                }
            })
        }));

        // responder side: the initiator's channel arrives here
        let tx = events.clone();
        let low_water_mark = self.low_water_mark;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(label = %dc.label(), "remote data channel announced");
                attach_channel(dc, tx, low_water_mark).await;
            })
        }));

        Ok(Box::new(WebRtcConnection {
            pc,
            events,
            low_water_mark: self.low_water_mark,
        }))
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
    low_water_mark: usize,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_channel(&self, label: &str) -> Result<(), TransportError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(negotiation)?;
        attach_channel(dc, self.events.clone(), self.low_water_mark).await;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let remote = to_rtc(offer)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation)?;

        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        let remote = to_rtc(answer)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(negotiation)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close");
        }
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(negotiation)
}

/// Wire the callbacks of `dc` to the session's event stream
async fn attach_channel(
    dc: Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<TransportEvent>,
    low_water_mark: usize,
) {
    let channel = Arc::new(WebRtcChannel {
        label: dc.label().to_string(),
        dc: dc.clone(),
        low: Arc::new(Notify::new()),
        low_water_mark,
    });

    dc.set_buffered_amount_low_threshold(low_water_mark).await;
    let low = channel.low.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let low = low.clone();
        Box::pin(async move { low.notify_waiters() })
    }))
    .await;

    let tx = events.clone();
    let opened = channel.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelOpen(opened));
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(_) => {
                        warn!("text frame with invalid utf-8 dropped");
                        return;
                    }
                }
            } else {
                Frame::Binary(msg.data)
            };
            let _ = tx.send(TransportEvent::Message(frame));
        })
    }));

    let label = channel.label.clone();
    dc.on_close(Box::new(move || {
        let tx = events.clone();
        let label = label.clone();
        Box::pin(async move {
            debug!(channel = %label, "data channel closed");
            let _ = tx.send(TransportEvent::ChannelClosed);
        })
    }));
}

pub struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    low: Arc<Notify>,
    low_water_mark: usize,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let sent = match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(data) => self.dc.send(&data).await,
        };
        sent.map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    async fn buffered_amount_low(&self) {
        self.low.notified().await
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(channel = %self.label, error = %e, "data channel close");
        }
    }
}
