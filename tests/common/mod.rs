#![allow(dead_code)]

use roomdrop::common::{Config, TransferConfig};
use roomdrop::peer::{LoopbackNetwork, OutboundSignal, PeerEvent, PeerSessionManager, PeerState};
use roomdrop::transfer::{FileLibrary, TransferEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

/// Deterministic, non-repeating-per-chunk test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn relay_config() -> Config {
    let mut config = Config::default();
    config.relay.host = "127.0.0.1".to_string();
    config.relay.port = 0;
    config
}

pub fn transfer_config() -> TransferConfig {
    TransferConfig {
        ice_servers: Vec::new(),
        ..TransferConfig::default()
    }
}

/// One client: its manager and the events it reported
pub struct TestPeer {
    pub id: String,
    pub manager: PeerSessionManager,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl TestPeer {
    /// Next event matching `pred`, skipping the rest
    pub async fn expect<F>(&mut self, what: &str, mut pred: F) -> PeerEvent
    where
        F: FnMut(&PeerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) if pred(&event) => return event,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("{}: event stream closed while waiting for {what}", self.id),
                Err(_) => panic!("{}: timed out waiting for {what}", self.id),
            }
        }
    }

    pub async fn expect_transfer<F>(&mut self, what: &str, mut pred: F) -> TransferEvent
    where
        F: FnMut(&TransferEvent) -> bool,
    {
        let event = self
            .expect(what, |event| matches!(event, PeerEvent::Transfer { event, .. } if pred(event)))
            .await;
        match event {
            PeerEvent::Transfer { event, .. } => event,
            _ => unreachable!(),
        }
    }

    /// Wait until the session with `peer` reports `state`
    pub async fn expect_state(&mut self, peer: &str, state: PeerState) {
        self.expect(&format!("{peer} {state:?}"), |event| {
            matches!(event, PeerEvent::StateChanged { peer_id, state: s } if peer_id == peer && *s == state)
        })
        .await;
    }

    /// Collect whatever arrives within `window`
    pub async fn drain_for(&mut self, window: Duration) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            out.push(event);
        }
        out
    }
}

/// Stands in for the relay: moves signals between managers in-process
pub struct SignalBus {
    targets: HashMap<String, PeerSessionManager>,
    sources: Vec<(String, mpsc::UnboundedReceiver<OutboundSignal>)>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
            sources: Vec::new(),
        }
    }

    /// Build a peer on `network` and attach it to the bus
    pub fn peer(&mut self, network: &LoopbackNetwork, id: &str, config: TransferConfig) -> TestPeer {
        let (manager, channels) =
            PeerSessionManager::new(network.transport(id), FileLibrary::new(), config);
        manager.set_local_id(id.to_string());

        self.targets.insert(id.to_string(), manager.clone());
        self.sources.push((id.to_string(), channels.signals));

        TestPeer {
            id: id.to_string(),
            manager,
            events: channels.events,
        }
    }

    /// Start forwarding. Peers added later are not routed.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        let targets = self.targets;
        self.sources
            .into_iter()
            .map(|(from, mut rx)| {
                let targets = targets.clone();
                tokio::spawn(async move {
                    while let Some(outbound) = rx.recv().await {
                        let Some(target) = targets.get(&outbound.target) else {
                            continue;
                        };
                        let payload = serde_json::to_value(&outbound.signal).unwrap();
                        target.handle_signal(&from, payload);
                    }
                })
            })
            .collect()
    }
}

/// Two peers on one network, `a` initiating, both channels open
pub async fn connected_pair(network: &LoopbackNetwork, config: TransferConfig) -> (TestPeer, TestPeer) {
    let mut bus = SignalBus::new();
    let mut a = bus.peer(network, "peer-a", config.clone());
    let mut b = bus.peer(network, "peer-b", config);
    bus.start();

    a.manager.connect("peer-b").unwrap();
    a.expect_state("peer-b", PeerState::Open).await;
    b.expect_state("peer-a", PeerState::Open).await;
    (a, b)
}
