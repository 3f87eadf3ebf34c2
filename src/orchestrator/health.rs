//! Worker health polling.

use std::time::Duration;

use tracing::{debug, warn};

/// Interval between health probes.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `{base_url}/health` until it answers 2xx or the budget expires.
///
/// Returns `true` once healthy. A timeout returns `false` without raising:
/// slow cold starts are expected, and callers treat this as "not yet
/// confirmed" rather than a failure.
pub async fn wait_until_healthy(client: &reqwest::Client, base_url: &str, timeout: Duration) -> bool {
    let health_url = format!("{base_url}/health");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match client
            .get(&health_url)
            .timeout(POLL_INTERVAL)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(url = %base_url, "worker is healthy");
                return true;
            }
            Ok(response) => {
                debug!(url = %base_url, status = %response.status(), "worker not ready");
            }
            Err(_) => {
                // Not listening yet.
            }
        }

        if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
            warn!(url = %base_url, timeout = ?timeout, "worker health check timed out");
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
