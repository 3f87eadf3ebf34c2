//! Idle reaper — periodic sweep destroying workers nobody is using.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::orchestrator::manager::LifecycleManager;

/// Spawn the background reaper loop.
///
/// Every `interval`, every session idle longer than `max_inactive` is
/// deprovisioned. The first tick fires immediately.
pub fn spawn_reaper_loop(
    manager: Arc<LifecycleManager>,
    interval: Duration,
    max_inactive: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            max_inactive_secs = max_inactive.as_secs(),
            "idle reaper started"
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let reaped = manager.cleanup_inactive(max_inactive).await;
            if reaped > 0 {
                info!(reaped, "idle reaper pass complete");
            }
        }
    })
}
