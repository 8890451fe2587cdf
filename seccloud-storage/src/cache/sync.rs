use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CacheSettings, ContentCache, SyncMode, SyncOutcome};

/// Running background sync task.
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stops the task after the pass in progress, if any, completes.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Background sync task ended abnormally: {}", e);
        }
    }
}

/// Delay before retry `attempt` (1-based): doubles from the base delay, capped.
pub(crate) fn backoff(settings: &CacheSettings, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    settings
        .retry_base_delay
        .saturating_mul(factor)
        .min(settings.retry_max_delay)
}

/// `from + delay`, saturating roughly a year ahead instead of overflowing.
pub(crate) fn deadline(from: Instant, delay: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);
    from.checked_add(delay.min(FAR_FUTURE)).unwrap_or(from)
}

impl ContentCache {
    /// Spawns the task committing dirty entries once their quiet period has
    /// passed. It wakes on every interval tick, on local writes and when the
    /// next deferred entry becomes due.
    pub fn start_sync(&self) -> SyncHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(self.clone().sync_loop(receiver));
        SyncHandle { shutdown, task }
    }

    async fn sync_loop(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.settings.sync_interval;
        info!(?interval, "Background sync started");

        // first pass picks up entries left dirty by a previous run
        let mut next_due = Some(Instant::now());
        loop {
            let fallback = deadline(Instant::now(), interval);
            let wake = next_due.map_or(fallback, |due| due.min(fallback));
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = self.inner.dirty.notified() => {}
                _ = shutdown.changed() => break,
            }
            next_due = self.sync_pass().await;
        }
        info!("Background sync stopped");
    }

    /// Syncs every dirty entry that is due. Returns when the earliest
    /// remaining dirty entry becomes due, if any.
    pub async fn sync_pass(&self) -> Option<Instant> {
        let registry = self.inner.engine.registry();
        if registry.reachable_count() < registry.len() {
            registry.refresh().await;
        }

        let dirty = self.dirty_ids();
        if dirty.is_empty() {
            return None;
        }

        let results: Vec<_> = stream::iter(dirty)
            .map(|id| async move {
                let outcome = self.sync_entry(&id, SyncMode::Background).await;
                (id, outcome)
            })
            .buffer_unordered(self.inner.settings.sync_concurrency.max(1))
            .collect()
            .await;

        let mut committed = 0;
        for (id, outcome) in results {
            match outcome {
                Ok(SyncOutcome::Committed(generation)) => {
                    debug!(data_id = %id, generation, "Background sync committed");
                    committed += 1;
                }
                Ok(SyncOutcome::Clean | SyncOutcome::Deferred(_)) => {}
                Err(e) => warn!(data_id = %id, "Background sync failed, will retry: {}", e),
            }
        }
        if committed > 0 {
            info!(committed, "Synced dirty cache entries");
        }

        let quiet_period = self.inner.settings.quiet_period;
        self.entries()
            .values()
            .filter(|e| e.dirty && !e.marked_for_deletion)
            .map(|e| e.due(quiet_period))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn settings(base_ms: u64, max_ms: u64) -> CacheSettings {
        CacheSettings {
            cache_dir: PathBuf::from("unused"),
            max_size: 0,
            sync_interval: Duration::from_secs(1),
            quiet_period: Duration::ZERO,
            retry_base_delay: Duration::from_millis(base_ms),
            retry_max_delay: Duration::from_millis(max_ms),
            flush_max_attempts: 1,
            sync_concurrency: 1,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let s = settings(100, 1_000);
        assert_eq!(backoff(&s, 1), Duration::from_millis(100));
        assert_eq!(backoff(&s, 2), Duration::from_millis(200));
        assert_eq!(backoff(&s, 4), Duration::from_millis(800));
        assert_eq!(backoff(&s, 5), Duration::from_millis(1_000));
        assert_eq!(backoff(&s, 80), Duration::from_millis(1_000));
    }

    #[test]
    fn test_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(deadline(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        let far = deadline(now, Duration::MAX);
        assert!(far > now + Duration::from_secs(364 * 24 * 3600));
    }
}
