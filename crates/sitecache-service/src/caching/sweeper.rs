use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::store::{Store, SweepCursor};
use crate::config::SweeperConfig;
use crate::storage::StorageResult;

/// Summary of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Number of expired entries removed.
    pub removed: usize,
    /// Number of batches it took.
    pub batches: usize,
    pub duration: Duration,
}

/// Periodically removes entries past their hard expiry.
///
/// Every batch is removed under the engine-wide maintenance lock, and the sweeper yields between
/// batches so it never monopolizes the store.
#[derive(Debug)]
pub struct Sweeper {
    store: Arc<Store>,
    maintenance: Arc<Mutex<()>>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(store: Arc<Store>, maintenance: Arc<Mutex<()>>, config: SweeperConfig) -> Self {
        Self {
            store,
            maintenance,
            config,
        }
    }

    /// Removes everything that expired before this sweep started.
    pub async fn run_once(&self) -> StorageResult<SweepStats> {
        let start = Instant::now();
        let now = Utc::now();
        let batch_size = self.config.batch_size.max(1);

        let mut cursor = SweepCursor::default();
        let mut stats = SweepStats::default();
        loop {
            let batch = {
                let _maintenance = self.maintenance.lock().await;
                self.store.sweep_batch(now, batch_size, &mut cursor)?
            };
            stats.batches += 1;
            stats.removed += batch.removed;
            if batch.done {
                break;
            }
            tokio::task::yield_now().await;
        }
        stats.duration = start.elapsed();

        let layout = self.store.layout().name();
        metric!(counter("caches.sweep.removed") += stats.removed as i64, "layout" => layout);
        metric!(timer("caches.sweep.duration") = stats.duration, "layout" => layout);
        Ok(stats)
    }

    /// Sweeps on a jittered interval until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval = ?self.config.interval,
            jitter = ?self.config.jitter,
            "Starting cache sweeper"
        );
        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.run_once().await {
                Ok(stats) if stats.removed > 0 => tracing::info!(
                    removed = stats.removed,
                    batches = stats.batches,
                    elapsed = ?stats.duration,
                    "Swept expired cache entries"
                ),
                Ok(_) => tracing::debug!("No expired cache entries to sweep"),
                Err(err) => tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to sweep expired cache entries"
                ),
            }
        }
        tracing::info!("Cache sweeper terminated");
    }

    /// The configured interval plus a random share of the jitter.
    fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        self.config.interval.saturating_add(jitter)
    }
}
