//! Client side glue: a relay connection feeding a [`PeerSessionManager`].

pub mod relay_client;

pub use relay_client::RelayClient;

use crate::peer::{OutboundSignal, PeerSessionManager};
use crate::relay::protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pump messages between the relay and the peer sessions until the relay
/// connection drops or `cancel` fires.
///
/// Every relay event is applied to `manager` first and then passed on to
/// `observer`, so the application still sees room and file events.
pub async fn run(
    manager: PeerSessionManager,
    relay: RelayClient,
    mut relay_events: mpsc::UnboundedReceiver<ServerMessage>,
    mut signals: mpsc::UnboundedReceiver<OutboundSignal>,
    observer: mpsc::UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("client cancelled");
                break;
            }
            event = relay_events.recv() => {
                let Some(event) = event else {
                    info!("relay connection lost");
                    break;
                };
                manager.handle_relay_message(&event);
                let _ = observer.send(event);
            }
            outbound = signals.recv() => {
                let Some(outbound) = outbound else { break };
                let payload = match serde_json::to_value(&outbound.signal) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to encode signal");
                        continue;
                    }
                };
                if relay.signal(&outbound.target, payload).is_err() {
                    info!("relay connection lost");
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    relay.close();
}
