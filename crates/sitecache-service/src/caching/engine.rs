use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use super::codec::deadline_after;
use super::registry::{CoalescingRegistry, Registration};
use super::store::{EntryState, Store, SweepCursor};
use super::sweeper::Sweeper;
use super::workers::{QueueKind, RecreateMode, RecreationJob, WorkerPool, execute};
use super::{CacheError, CacheResult};
use crate::config::{Config, EngineConfig, SweeperConfig};
use crate::storage::StorageResult;

/// Smallest and largest number of keys removed per batch by
/// [`clear_cache_by_prefix`](CacheEngine::clear_cache_by_prefix).
const PREFIX_DELETE_BATCH_LIMITS: (usize, usize) = (1_000, 10_000);

struct EngineInner {
    store: Arc<Store>,
    registry: Arc<CoalescingRegistry>,
    workers: WorkerPool,
    /// Serializes bulk deletions and sweep batches.
    maintenance: Arc<Mutex<()>>,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // stops the sweeper, the dispatchers also notice their closed queues
        self.shutdown.cancel();
    }
}

/// The cache-recreation engine.
///
/// Owns the [`Store`], the registry of in-flight recreations and the recreation queues. This is
/// cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("store", &self.inner.store)
            .field("registry", &self.inner.registry)
            .field("workers", &self.inner.workers)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl CacheEngine {
    /// Creates an engine on top of `store`, spawning its workers onto `runtime`.
    ///
    /// This does not start a [`Sweeper`], see [`spawn_sweeper`](Self::spawn_sweeper).
    pub fn new(store: Arc<Store>, config: EngineConfig, runtime: &Handle) -> Self {
        let shutdown = CancellationToken::new();
        let workers = WorkerPool::start(Arc::clone(&store), &config, runtime, shutdown.clone());
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry: CoalescingRegistry::new(),
                workers,
                maintenance: Arc::new(Mutex::new(())),
                config,
                shutdown,
            }),
        }
    }

    /// Opens the configured store and starts the engine, including its sweeper if enabled.
    pub fn start(config: &Config, runtime: &Handle) -> StorageResult<Self> {
        let store = Arc::new(Store::open(config)?);
        tracing::info!(
            backend = store.backend(),
            layout = store.layout().name(),
            "Starting cache engine"
        );
        let engine = Self::new(store, config.engine.clone(), runtime);
        if config.sweeper.enabled {
            engine.spawn_sweeper(config.sweeper.clone(), runtime);
        }
        Ok(engine)
    }

    /// A sweeper sharing this engine's store and maintenance lock.
    pub fn sweeper(&self, config: SweeperConfig) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.maintenance),
            config,
        )
    }

    /// Runs a [`Sweeper`] in the background until the engine shuts down.
    pub fn spawn_sweeper(&self, config: SweeperConfig, runtime: &Handle) {
        let sweeper = self.sweeper(config);
        runtime.spawn(
            sweeper
                .run(self.inner.shutdown.child_token())
                .bind_hub(Hub::new_from_top(Hub::current())),
        );
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Returns the value for `key`, recreating it if necessary.
    ///
    /// - A fresh value is returned as is.
    /// - A stale value, one past its `fresh_timeout` but within `extended_timeout`, is returned
    ///   as well, and a refresh is scheduled in the background unless one is already running.
    /// - Otherwise, or if `bypass_cache` is set, the value is recreated while the caller waits.
    ///   Concurrent callers for the same key wait for that same recreation and receive its
    ///   outcome, so `recreate` runs at most once per key at any time.
    ///
    /// With a zero `extended_timeout` the recreation runs directly on the calling task, otherwise
    /// it runs on one of the recreation queues. A failed recreation removes the existing entry,
    /// so the following call starts over with a miss.
    ///
    /// There is no timeout on `recreate`. A warning is logged when waiting for it takes longer
    /// than the configured `slow_recreation_warning`.
    pub async fn get_cached_timeout<F, Fut>(
        &self,
        key: &str,
        fresh_timeout: Duration,
        extended_timeout: Duration,
        recreate: F,
        bypass_cache: bool,
    ) -> CacheResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult> + Send + 'static,
    {
        validate_key(key)?;
        metric!(counter("caches.access") += 1);

        let (guard, existing) = loop {
            let existing = if bypass_cache {
                None
            } else {
                self.inner.store.read(key)?
            };

            if let Some(entry) = &existing {
                match entry.state(Utc::now()) {
                    EntryState::Fresh => {
                        metric!(counter("caches.hit") += 1, "state" => "fresh");
                        return Ok(entry.value.clone());
                    }
                    EntryState::Stale => {
                        metric!(counter("caches.hit") += 1, "state" => "stale");
                        if let Registration::Acquired(guard) = self.inner.registry.register(key) {
                            let job = RecreationJob {
                                guard,
                                recreate: Box::new(move || recreate().boxed()),
                                fresh_timeout,
                                extended_timeout,
                                evict_on_failure: true,
                                done_tx: None,
                            };
                            if let Err(err) = self.enqueue(job).await {
                                tracing::debug!(
                                    error = &err as &dyn std::error::Error,
                                    key,
                                    "Not refreshing stale cache entry"
                                );
                            }
                        }
                        return Ok(entry.value.clone());
                    }
                    EntryState::Expired => {}
                }
            }

            match self.inner.registry.register(key) {
                Registration::Acquired(guard) => break (guard, existing),
                Registration::Busy(waiter) => {
                    metric!(counter("caches.coalesced") += 1);
                    let waited = waiter.wait(self.inner.config.coalescing_poll_interval);
                    if let Some(outcome) = self.warn_if_slow(key, waited).await {
                        return outcome;
                    }
                    // the recreation went away without a result, start over
                }
            }
        };

        // Somebody else may have finished a recreation between our lookup and registration.
        if !bypass_cache {
            if let Some(entry) = self.inner.store.read(key)? {
                if entry.state(Utc::now()) == EntryState::Fresh {
                    metric!(counter("caches.hit") += 1, "state" => "fresh");
                    return Ok(entry.value);
                }
            }
        }
        metric!(counter("caches.miss") += 1);

        let mut job = RecreationJob {
            guard,
            recreate: Box::new(move || recreate().boxed()),
            fresh_timeout,
            extended_timeout,
            // only an entry that was actually read is evicted, bypassing callers leave it alone
            evict_on_failure: existing.is_some(),
            done_tx: None,
        };

        if extended_timeout.is_zero() {
            let store = &self.inner.store;
            return self
                .warn_if_slow(key, execute(store, job, RecreateMode::Inline))
                .await;
        }

        let (done_tx, done_rx) = oneshot::channel();
        job.done_tx = Some(done_tx);
        self.enqueue(job).await?;
        // a dropped sender means the job was discarded on shutdown
        self.warn_if_slow(key, done_rx.map(|done| done.unwrap_or(Err(CacheError::Shutdown))))
            .await
    }

    /// Returns the value for `key` until its hard expiry, without recreating anything.
    pub fn get_cached(&self, key: &str) -> CacheResult<Option<Bytes>> {
        validate_key(key)?;
        metric!(counter("caches.access") += 1);
        let now = Utc::now();
        match self.inner.store.read(key)? {
            Some(entry) if entry.state(now) != EntryState::Expired => {
                metric!(counter("caches.hit") += 1, "state" => entry.state(now).as_str());
                Ok(Some(entry.value))
            }
            _ => {
                metric!(counter("caches.miss") += 1);
                Ok(None)
            }
        }
    }

    /// Stores `value` under `key` for `ttl`, with no stale period.
    pub fn put_cached(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        validate_key(key)?;
        let expire_at = deadline_after(Utc::now(), ttl);
        self.inner.store.write(key, value, expire_at, expire_at)?;
        Ok(())
    }

    /// Removes every entry whose key starts with `prefix`.
    ///
    /// Holds the engine-wide maintenance lock for the whole operation, and yields between
    /// batches. Returns the number of removed entries.
    pub async fn clear_cache_by_prefix(&self, prefix: &str) -> CacheResult<usize> {
        let (min, max) = PREFIX_DELETE_BATCH_LIMITS;
        let batch_size = self.inner.config.prefix_delete_batch_size.clamp(min, max);

        let _maintenance = self.inner.maintenance.lock().await;
        let start = Instant::now();
        let mut cursor = SweepCursor::default();
        let mut removed = 0;
        loop {
            let batch = self
                .inner
                .store
                .remove_prefix_batch(prefix, batch_size, &mut cursor)?;
            removed += batch.removed;
            if batch.done {
                break;
            }
            tokio::task::yield_now().await;
        }

        metric!(counter("caches.clear.removed") += removed as i64);
        tracing::info!(prefix, removed, elapsed = ?start.elapsed(), "Cleared cache prefix");
        Ok(removed)
    }

    /// The keys currently being recreated, with how long each has been running.
    pub fn in_flight(&self) -> Vec<(String, Duration)> {
        self.inner.registry.running()
    }

    /// Number of recreations waiting in the given queue.
    pub fn queued(&self, kind: QueueKind) -> usize {
        self.inner.workers.queued(kind)
    }

    /// Stops the sweeper and the recreation queues.
    ///
    /// Queued recreations are dropped and their waiters receive [`CacheError::Shutdown`], as
    /// does every later call that needs a queue. Recreations that already started run to
    /// completion.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("Shutting down cache engine");
            self.inner.shutdown.cancel();
        }
    }

    async fn enqueue(&self, job: RecreationJob) -> CacheResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CacheError::Shutdown);
        }
        let queue = self.inner.workers.submit(job).await?;
        tracing::trace!(queue = queue.as_str(), "Enqueued recreation");
        Ok(())
    }

    /// Awaits `future`, logging a warning once it took longer than the slow threshold.
    async fn warn_if_slow<T>(&self, key: &str, future: impl Future<Output = T>) -> T {
        let threshold = self.inner.config.slow_recreation_warning;
        let start = Instant::now();
        tokio::pin!(future);

        tokio::select! {
            output = &mut future => return output,
            _ = tokio::time::sleep(threshold) => {}
        }
        metric!(counter("caches.recreate.slow") += 1);
        tracing::warn!(key, elapsed = ?threshold, "Waiting for a slow cache recreation");

        let output = future.await;
        tracing::info!(key, elapsed = ?start.elapsed(), "Slow cache recreation finished");
        output
    }
}

fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey(key.to_owned()));
    }
    Ok(())
}
