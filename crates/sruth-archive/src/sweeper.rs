use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive::Archive;
use crate::delay_queue::PathDelayQueue;

/// Periodically applies any deletion whose deadline in `queue` has elapsed.
/// Runs until `cancel` fires; intended to be spawned once per node
/// alongside the archive it serves.
pub async fn run(
    archive: Arc<Archive>,
    queue: Arc<PathDelayQueue>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let now_millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as i64;
                match queue.pop_expired(now_millis) {
                    Ok(paths) => {
                        for path in paths {
                            match archive.remove_path(&path).await {
                                Ok(()) => info!(%path, "applied scheduled deletion"),
                                Err(err) => warn!(%path, %err, "scheduled deletion failed"),
                            }
                        }
                    }
                    Err(err) => warn!(%err, "failed to poll the deletion queue"),
                }
            }
        }
    }
}
