//! C6: the periodic reaper. Deliberately stateless -- it never inspects the
//! session store, only the temporary-chunk directory on disk -- so an
//! orphaned chunk (its session lost, its file lingering) is eventually
//! collected regardless of how it was orphaned (§4.6).

use crate::metrics::CollectorMetrics;
use crate::storage::StorageService;
use slog::{info, warn, Logger};
use std::time::Duration;

/// Spawns a background task that sweeps the temporary-chunk directory every
/// `interval`, removing files older than `interval`. Returns the task handle;
/// dropping it does not stop the sweep (it is detached, matching how the
/// reference system spawns its long-running metrics endpoint).
pub fn spawn(storage: StorageService, interval: Duration, metrics: CollectorMetrics, logger: Logger) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            metrics.reap_sweeps.inc();
            match storage.reap_expired(interval).await {
                Ok(removed) => {
                    metrics.reap_files_removed.inc_by(removed as u64);
                    if removed > 0 {
                        info!(logger, "reap sweep removed expired chunks"; "count" => removed);
                    }
                }
                Err(error) => {
                    warn!(logger, "reap sweep failed, will retry next tick"; "error" => error.to_string());
                }
            }
        }
    })
}
