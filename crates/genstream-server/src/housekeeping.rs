//! Periodic eviction of expired sessions.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;

/// Spawn the eviction sweep. It runs every `interval` until `cancel` fires.
pub fn spawn_housekeeping(
    registry: SessionRegistry,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        log::info!("Session housekeeping started (interval {:?})", interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Session housekeeping stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = registry.evict_expired();
                    if evicted > 0 {
                        log::info!("Evicted {} expired session logs", evicted);
                    } else {
                        log::debug!("Housekeeping sweep found nothing to evict");
                    }
                }
            }
        }
    })
}
