//! In-memory negotiation transport.
//!
//! Every client gets a [`LoopbackTransport`] from a shared [`LoopbackNetwork`].
//! Offers and answers are opaque strings; the channel pair is linked when the
//! initiator applies the answer. Each channel half owns a drain task that moves
//! queued frames to the other side, so the buffered amount and the low-water
//! notification behave like a real send buffer.

use crate::common::ClientId;
use crate::peer::transport::{
    DataChannel, Frame, IceCandidate, NegotiationTransport, PeerConnection, SessionDescription,
    TransportError, TransportEvent, CHANNEL_LABEL,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    endpoints: DashMap<(ClientId, ClientId), Arc<Endpoint>>,
    unreachable: Mutex<HashSet<ClientId>>,
    low_water_mark: usize,
    drain_delay: Duration,
    /// Highest buffered amount seen when a binary frame was handed to `send`
    peak_buffered: AtomicUsize,
}

impl LoopbackNetwork {
    pub fn new(low_water_mark: usize) -> Self {
        Self::with_drain_delay(low_water_mark, Duration::ZERO)
    }

    /// Every frame sits in the send buffer for `drain_delay` before delivery
    pub fn with_drain_delay(low_water_mark: usize, drain_delay: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: DashMap::new(),
                unreachable: Mutex::new(HashSet::new()),
                low_water_mark,
                drain_delay,
                peak_buffered: AtomicUsize::new(0),
            }),
        }
    }

    pub fn transport(&self, local_id: impl Into<ClientId>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
            local_id: local_id.into(),
        })
    }

    /// Channels never link to or from an unreachable client
    pub fn set_reachable(&self, client_id: &str, reachable: bool) {
        if let Ok(mut unreachable) = self.inner.unreachable.lock() {
            if reachable {
                unreachable.remove(client_id);
            } else {
                unreachable.insert(client_id.to_string());
            }
        }
    }

    pub fn peak_buffered_at_chunk_send(&self) -> usize {
        self.inner.peak_buffered.load(Ordering::SeqCst)
    }

    pub fn low_water_mark(&self) -> usize {
        self.inner.low_water_mark
    }

    fn is_reachable(&self, client_id: &str) -> bool {
        self.inner
            .unreachable
            .lock()
            .map(|set| !set.contains(client_id))
            .unwrap_or(true)
    }
}

pub struct LoopbackTransport {
    network: LoopbackNetwork,
    local_id: ClientId,
}

#[async_trait]
impl NegotiationTransport for LoopbackTransport {
    async fn connect(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let endpoint = Arc::new(Endpoint {
            local: self.local_id.clone(),
            peer: peer_id.to_string(),
            events,
            state: Mutex::new(EndpointState::default()),
        });
        // a newer connection to the same peer replaces the old one
        self.network.inner.endpoints.insert(
            (self.local_id.clone(), peer_id.to_string()),
            endpoint.clone(),
        );

        Ok(Box::new(LoopbackConnection {
            network: self.network.clone(),
            endpoint,
        }))
    }
}

struct Endpoint {
    local: ClientId,
    peer: ClientId,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    label: Option<String>,
    local_description: bool,
    remote_description: bool,
    channel: Option<Arc<LoopbackChannel>>,
    closed: bool,
}

impl Endpoint {
    fn with_state<T>(&self, f: impl FnOnce(&mut EndpointState) -> T) -> Result<T, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Negotiation("endpoint state poisoned".into()))?;
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(f(&mut state))
    }

    fn local_candidate(&self) {
        let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 loopback 1 {} 0 typ host", self.local),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }
}

pub struct LoopbackConnection {
    network: LoopbackNetwork,
    endpoint: Arc<Endpoint>,
}

impl LoopbackConnection {
    /// Wire a channel pair between this endpoint and its counterpart
    fn link(&self) -> Result<(), TransportError> {
        let local = &self.endpoint.local;
        let peer = &self.endpoint.peer;

        if !self.network.is_reachable(local) || !self.network.is_reachable(peer) {
            debug!(local = %local, peer = %peer, "loopback peer unreachable, channel not linked");
            return Ok(());
        }

        let Some(counterpart) = self
            .network
            .inner
            .endpoints
            .get(&(peer.clone(), local.clone()))
            .map(|e| e.value().clone())
        else {
            debug!(local = %local, peer = %peer, "no counterpart endpoint");
            return Ok(());
        };

        let label = self
            .endpoint
            .with_state(|s| s.label.clone())?
            .unwrap_or_else(|| CHANNEL_LABEL.to_string());

        let open = Arc::new(AtomicBool::new(true));
        let ours = LoopbackChannel::spawn(&label, counterpart.events.clone(), open.clone(), &self.network);
        let theirs = LoopbackChannel::spawn(&label, self.endpoint.events.clone(), open, &self.network);

        self.endpoint.with_state(|s| s.channel = Some(ours.clone()))?;
        counterpart.with_state(|s| s.channel = Some(theirs.clone()))?;

        let _ = self.endpoint.events.send(TransportEvent::ChannelOpen(ours));
        let _ = counterpart.events.send(TransportEvent::ChannelOpen(theirs));
        debug!(local = %local, peer = %peer, label = %label, "loopback channel linked");
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_channel(&self, label: &str) -> Result<(), TransportError> {
        self.endpoint
            .with_state(|s| s.label = Some(label.to_string()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.endpoint.with_state(|s| s.local_description = true)?;
        self.endpoint.local_candidate();
        Ok(SessionDescription::offer(format!(
            "loopback offer {} -> {}",
            self.endpoint.local, self.endpoint.peer
        )))
    }

    async fn accept_offer(
        &self,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.endpoint.with_state(|s| {
            s.remote_description = true;
            s.local_description = true;
        })?;
        self.endpoint.local_candidate();
        Ok(SessionDescription::answer(format!(
            "loopback answer {} -> {}",
            self.endpoint.local, self.endpoint.peer
        )))
    }

    async fn accept_answer(&self, _answer: SessionDescription) -> Result<(), TransportError> {
        let ready = self.endpoint.with_state(|s| {
            if !s.local_description || s.remote_description {
                return false;
            }
            s.remote_description = true;
            true
        })?;
        if !ready {
            return Err(TransportError::Negotiation("answer without a pending offer".into()));
        }
        self.link()
    }

    async fn add_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        self.endpoint.with_state(|s| {
            if !s.remote_description {
                return Err(TransportError::Negotiation("remote description not set".into()));
            }
            Ok(())
        })?
    }

    async fn close(&self) {
        let channel = match self.endpoint.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                state.channel.take()
            }
            Err(_) => None,
        };
        if let Some(channel) = channel {
            channel.close().await;
        }

        let key = (self.endpoint.local.clone(), self.endpoint.peer.clone());
        self.network
            .inner
            .endpoints
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &self.endpoint));
    }
}

enum Drain {
    Frame(Frame),
    Close,
}

/// One half of a linked channel pair
pub struct LoopbackChannel {
    label: String,
    queue: mpsc::UnboundedSender<Drain>,
    buffered: Arc<AtomicUsize>,
    low: Arc<Notify>,
    low_water_mark: usize,
    /// Shared by both halves
    open: Arc<AtomicBool>,
    network: LoopbackNetwork,
}

impl LoopbackChannel {
    fn spawn(
        label: &str,
        remote: mpsc::UnboundedSender<TransportEvent>,
        open: Arc<AtomicBool>,
        network: &LoopbackNetwork,
    ) -> Arc<Self> {
        let (queue, mut rx) = mpsc::unbounded_channel::<Drain>();
        let buffered = Arc::new(AtomicUsize::new(0));
        let low = Arc::new(Notify::new());
        let low_water_mark = network.inner.low_water_mark;
        let delay = network.inner.drain_delay;

        let drained = buffered.clone();
        let notify = low.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Drain::Frame(frame) => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let len = frame.len();
                        let _ = remote.send(TransportEvent::Message(frame));
                        let left = drained.fetch_sub(len, Ordering::SeqCst) - len;
                        if left <= low_water_mark {
                            notify.notify_waiters();
                        }
                    }
                    Drain::Close => {
                        let _ = remote.send(TransportEvent::ChannelClosed);
                        break;
                    }
                }
            }
        });

        Arc::new(Self {
            label: label.to_string(),
            queue,
            buffered,
            low,
            low_water_mark,
            open,
            network: network.clone(),
        })
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let before = self.buffered.fetch_add(frame.len(), Ordering::SeqCst);
        if matches!(frame, Frame::Binary(_)) {
            self.network
                .inner
                .peak_buffered
                .fetch_max(before, Ordering::SeqCst);
        }
        self.queue
            .send(Drain::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    async fn buffered_amount_low(&self) {
        self.low.notified().await
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.queue.send(Drain::Close);
        }
    }
}
