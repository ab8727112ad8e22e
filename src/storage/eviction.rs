//! Background eviction of idle client records.

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::manager::StorageManager;

/// Spawn the sweep loop for `storage`.
///
/// The worker only holds a weak reference, so it also exits once the
/// manager is dropped. Cancellation is checked before every sweep and a
/// sweep in progress always runs to completion.
pub(crate) fn spawn_eviction_worker(
    storage: Weak<StorageManager>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval = ?interval, "Eviction worker started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(storage) = storage.upgrade() else { break };
                    storage.evict_stale().await;
                }
            }
        }

        info!("Eviction worker stopped");
    })
}
