use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;

/// How often the append counter is checked.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once, if at least `threshold` events were appended since the last
/// compaction. Returns the number of events in the rewritten WAL.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Option<usize> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return None;
    }
    match engine.compact_wal().await {
        Ok(kept) => {
            info!("compacted WAL: {appends} appends folded into {kept} events");
            Some(kept)
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            None
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await.is_none() {
            debug!("compactor: nothing to do");
        }
    }
}
