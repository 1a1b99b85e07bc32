use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::observability;

/// Background task that periodically cleans up expired holds.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let expired = engine.collect_expired_holds(now);
        for (hold_id, _staff_id) in expired {
            match engine.release_hold(hold_id).await {
                Ok(_) => {
                    metrics::counter!(observability::HOLDS_REAPED_TOTAL).increment(1);
                    info!("reaped expired hold {hold_id}");
                }
                Err(e) => {
                    // May already have been released concurrently
                    tracing::debug!("reaper skip {hold_id}: {e}");
                }
            }
        }
    }
}

/// Background task that rewrites the WAL as a state snapshot once enough
/// appends have accumulated since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("compaction failed: {e}"),
        }
    }
}
