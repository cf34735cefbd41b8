use lib_waitline::LineRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Periodically hands expired accesses back to their lines.
pub async fn run(
    registry: Arc<LineRegistry>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut check_interval = interval(period);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Reaper received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let reclaimed = reap_once(&registry);
                if reclaimed > 0 {
                    log::debug!("Reaper reclaimed {} expired access(es)", reclaimed);
                }
            }
        }
    }
}

/// One sweep over every registered line. Returns the number of reclaimed
/// accesses; a failing line is logged and skipped.
pub fn reap_once(registry: &LineRegistry) -> usize {
    registry
        .lines()
        .iter()
        .map(|line| match line.reclaim_expired() {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                log::warn!("Failed to reclaim expired accesses of line '{}': {}", line.id(), e);
                0
            }
        })
        .sum()
}
