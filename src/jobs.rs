use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that stamps reminders for bookings entering the
/// lead window. The stamp is a lifecycle event like any other, so the
/// notification hub carries it to the external dispatcher; this task
/// never composes or sends messages itself.
pub async fn run_reminder_sweep(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let now = engine.clock.now_ms();
        for (booking_id, _location_id) in engine.collect_due_reminders(now) {
            match engine.mark_reminder_sent(booking_id).await {
                Ok(_) => info!("reminder queued for booking {booking_id}"),
                Err(e) => {
                    // May have been cancelled or stamped concurrently.
                    tracing::debug!("reminder sweep skip {booking_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("wal compacted after {appends} appends"),
                Err(e) => tracing::warn!("wal compaction failed: {e}"),
            }
        }
    }
}
