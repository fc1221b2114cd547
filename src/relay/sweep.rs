use crate::relay::registry::RoomRegistry;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Periodically delete rooms older than `max_age`
pub fn spawn_sweeper(
    registry: RoomRegistry,
    every: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.sweep(max_age);
                    if removed > 0 {
                        debug!(removed, remaining = registry.room_count(), "room sweep");
                    }
                }
            }
        }
    })
}
