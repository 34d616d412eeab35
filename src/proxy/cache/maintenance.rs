use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::ResponseCache;

/// Periodically drops expired entries so memory held by stale responses is released even when
/// their keys are never requested again. Returns `None` when `interval` is zero.
pub fn spawn_cache_sweeper(
    cache: Arc<ResponseCache>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.purge_expired();
            crate::metrics::record_cache_sweep_run();
            crate::metrics::record_cache_sweep_removed(removed as u64);
            if removed > 0 {
                debug!(
                    removed,
                    remaining = cache.len(),
                    "cache sweep removed expired entries"
                );
            }
        }
    }))
}
