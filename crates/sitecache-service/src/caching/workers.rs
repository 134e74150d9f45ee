use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::codec::deadline_after;
use super::registry::InFlightGuard;
use super::store::Store;
use super::{CacheError, CacheResult};
use crate::config::EngineConfig;
use crate::utils::defer::defer;

pub(crate) type RecreateFuture = BoxFuture<'static, CacheResult>;
pub(crate) type RecreateFn = Box<dyn FnOnce() -> RecreateFuture + Send>;

/// The queue a recreation runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    General,
    /// Small internal lookups, kept apart so they never wait behind page renders.
    Inner,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::General => "general",
            QueueKind::Inner => "inner",
        }
    }
}

/// How a recreation was triggered, used to tag logs and metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecreateMode {
    /// Run directly by the caller, for entries without stale tolerance.
    Inline,
    /// Run by a worker while the caller waits for it.
    Queued,
    /// Run by a worker after a stale value was served. Nobody waits for it.
    Background,
}

impl RecreateMode {
    fn as_str(&self) -> &'static str {
        match self {
            RecreateMode::Inline => "inline",
            RecreateMode::Queued => "queued",
            RecreateMode::Background => "background",
        }
    }
}

/// A single recreation of a cache entry.
pub(crate) struct RecreationJob {
    /// Registration of the key, released once the job is done or dropped.
    pub guard: InFlightGuard,
    pub recreate: RecreateFn,
    pub fresh_timeout: Duration,
    pub extended_timeout: Duration,
    /// Remove the existing entry if the recreation fails.
    pub evict_on_failure: bool,
    /// Receives the outcome, if somebody is waiting for it.
    pub done_tx: Option<oneshot::Sender<CacheResult>>,
}

impl fmt::Debug for RecreationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecreationJob")
            .field("key", &self.guard.key())
            .field("fresh_timeout", &self.fresh_timeout)
            .field("extended_timeout", &self.extended_timeout)
            .field("evict_on_failure", &self.evict_on_failure)
            .field("has_waiter", &self.done_tx.is_some())
            .finish()
    }
}

impl RecreationJob {
    fn mode(&self) -> RecreateMode {
        match self.done_tx {
            Some(_) => RecreateMode::Queued,
            None => RecreateMode::Background,
        }
    }
}

/// Runs a recreation and stores its result.
///
/// On success the value is written with fresh deadlines. On failure the existing entry is
/// evicted if the job asks for it, so that a failing key turns into a plain miss instead of
/// serving an old value forever. The outcome is published to coalesced waiters and the
/// `done_tx` of the job, and the key is unregistered in any case.
pub(crate) async fn execute(store: &Store, job: RecreationJob, mode: RecreateMode) -> CacheResult {
    let RecreationJob {
        guard,
        recreate,
        fresh_timeout,
        extended_timeout,
        evict_on_failure,
        done_tx,
    } = job;
    let key = guard.key().to_owned();

    metric!(counter("caches.recreate") += 1, "mode" => mode.as_str());
    let start = Instant::now();
    let result = AssertUnwindSafe(async move { recreate().await })
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(CacheError::from_panic(payload)));
    metric!(timer("caches.recreate.duration") = start.elapsed(), "mode" => mode.as_str());

    let result = match result {
        Ok(value) => {
            let fresh_until = deadline_after(Utc::now(), fresh_timeout);
            let stale_until = deadline_after(fresh_until, extended_timeout);
            match store.write(&key, &value, fresh_until, stale_until) {
                Ok(()) => {
                    tracing::trace!(key = %key, mode = mode.as_str(), "Recreated cache entry");
                    Ok(value)
                }
                Err(err) => Err(CacheError::from(err)),
            }
        }
        Err(err) => {
            metric!(
                counter("caches.recreate.error") += 1,
                "mode" => mode.as_str(),
                "error" => err.metric_tag(),
            );
            if err.is_not_found() {
                tracing::debug!(key = %key, "Recreation found nothing to cache");
            } else {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    key = %key,
                    mode = mode.as_str(),
                    "Failed to recreate cache entry",
                );
            }

            if evict_on_failure {
                // best effort, the error of the recreation is what the caller needs to see
                if let Err(evict_err) = store.remove(&key) {
                    tracing::warn!(
                        error = &evict_err as &dyn std::error::Error,
                        key = %key,
                        "Failed to evict stale cache entry",
                    );
                }
            }
            Err(err)
        }
    };

    guard.complete(&result);
    if let Some(done_tx) = done_tx {
        // the waiter may have given up already
        done_tx.send(result.clone()).ok();
    }
    result
}

/// Bounded recreation queues, each drained by a fixed number of concurrent workers.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    general: mpsc::Sender<RecreationJob>,
    inner: mpsc::Sender<RecreationJob>,
    inner_key_prefix: String,
}

impl WorkerPool {
    /// Spawns the dispatchers of both queues onto the runtime.
    pub fn start(
        store: Arc<Store>,
        config: &EngineConfig,
        runtime: &Handle,
        shutdown: CancellationToken,
    ) -> Self {
        let spawn_queue = |kind: QueueKind, capacity: usize, workers: usize| {
            // both need to be at least 1, or nothing would ever run
            let capacity = capacity.max(1);
            let workers = workers.max(1);
            let (tx, rx) = mpsc::channel(capacity);
            runtime.spawn(
                dispatch(kind, rx, Arc::clone(&store), workers, shutdown.clone())
                    .bind_hub(Hub::new_from_top(Hub::current())),
            );
            tx
        };

        Self {
            general: spawn_queue(
                QueueKind::General,
                config.general_queue_size,
                config.general_workers,
            ),
            inner: spawn_queue(
                QueueKind::Inner,
                config.inner_queue_size,
                config.inner_workers,
            ),
            inner_key_prefix: config.inner_key_prefix.clone(),
        }
    }

    pub fn queue_for(&self, key: &str) -> QueueKind {
        if !self.inner_key_prefix.is_empty() && key.starts_with(&self.inner_key_prefix) {
            QueueKind::Inner
        } else {
            QueueKind::General
        }
    }

    /// Enqueues a job, waiting for room if the queue is full.
    ///
    /// Fails only if the engine was shut down. The job is dropped in that case, which
    /// unregisters its key.
    pub async fn submit(&self, job: RecreationJob) -> CacheResult<QueueKind> {
        let kind = self.queue_for(job.guard.key());
        let queue = self.sender(kind);

        if queue.capacity() == 0 {
            metric!(counter("caches.queue.full") += 1, "queue" => kind.as_str());
            tracing::debug!(
                key = job.guard.key(),
                queue = kind.as_str(),
                "Recreation queue is full"
            );
        }
        queue.send(job).await.map_err(|_| CacheError::Shutdown)?;
        metric!(
            gauge("caches.queue.capacity") = queue.capacity() as u64,
            "queue" => kind.as_str(),
        );
        Ok(kind)
    }

    /// Number of jobs waiting in the given queue.
    pub fn queued(&self, kind: QueueKind) -> usize {
        let queue = self.sender(kind);
        queue.max_capacity() - queue.capacity()
    }

    fn sender(&self, kind: QueueKind) -> &mpsc::Sender<RecreationJob> {
        match kind {
            QueueKind::General => &self.general,
            QueueKind::Inner => &self.inner,
        }
    }
}

/// Long running task feeding one queue into at most `max_concurrent` running jobs.
async fn dispatch(
    kind: QueueKind,
    mut work_rx: mpsc::Receiver<RecreationJob>,
    store: Arc<Store>,
    max_concurrent: usize,
    shutdown: CancellationToken,
) {
    let (done_tx, mut done_rx) = mpsc::channel::<()>(max_concurrent);
    let running = Arc::new(AtomicUsize::new(0));
    let mut free_slots = max_concurrent;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            job = work_rx.recv(), if free_slots > 0 => {
                let Some(job) = job else { break };
                free_slots -= 1;
                tokio::spawn(
                    run_job(done_tx.clone(), Arc::clone(&store), job, Arc::clone(&running), kind)
                        .bind_hub(Hub::new_from_top(Hub::current()))
                );
            }
            Some(()) = done_rx.recv() => {
                free_slots += 1;
            }
        }
    }
    tracing::info!(queue = kind.as_str(), "Recreation dispatcher terminated");
}

/// Runs one job on a worker slot and hands the slot back afterwards.
async fn run_job(
    done_tx: mpsc::Sender<()>,
    store: Arc<Store>,
    job: RecreationJob,
    running: Arc<AtomicUsize>,
    kind: QueueKind,
) {
    let in_flight = running.fetch_add(1, Ordering::Relaxed) + 1;
    metric!(gauge("caches.workers.busy") = in_flight as u64, "queue" => kind.as_str());
    let _release = defer(move || {
        running.fetch_sub(1, Ordering::Relaxed);
    });

    let mode = job.mode();
    execute(&store, job, mode).await.ok();
    done_tx.send(()).await.ok();
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::caching::registry::{CoalescingRegistry, Registration};
    use crate::storage::{Layout, MemoryEngine};

    fn store() -> Arc<Store> {
        Arc::new(Store::new(
            Box::new(MemoryEngine::new()),
            Layout::InvertedIndex,
            3,
        ))
    }

    fn job(
        registry: &Arc<CoalescingRegistry>,
        key: &str,
        recreate: impl FnOnce() -> RecreateFuture + Send + 'static,
    ) -> RecreationJob {
        let Registration::Acquired(guard) = registry.register(key) else {
            panic!("key {key} is already registered");
        };
        RecreationJob {
            guard,
            recreate: Box::new(recreate),
            fresh_timeout: Duration::from_secs(30),
            extended_timeout: Duration::from_secs(300),
            evict_on_failure: true,
            done_tx: None,
        }
    }

    fn exploding_template() -> CacheResult {
        panic!("template exploded")
    }

    #[test]
    fn inner_prefix_selects_queue() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = WorkerPool::start(
            store(),
            &EngineConfig::default(),
            runtime.handle(),
            CancellationToken::new(),
        );
        assert_eq!(pool.queue_for("in:bot-ranges"), QueueKind::Inner);
        assert_eq!(pool.queue_for("topcat:site.com:en"), QueueKind::General);
        assert_eq!(pool.queue_for("index:in:"), QueueKind::General);
    }

    #[tokio::test]
    async fn execute_writes_and_signals() {
        let store = store();
        let registry = CoalescingRegistry::new();
        let (done_tx, done_rx) = oneshot::channel();
        let mut job = job(&registry, "page", || {
            async { CacheResult::Ok(Bytes::from_static(b"<html/>")) }.boxed()
        });
        job.done_tx = Some(done_tx);

        let result = execute(&store, job, RecreateMode::Queued).await;
        assert_eq!(result, Ok(Bytes::from_static(b"<html/>")));
        assert_eq!(done_rx.await.unwrap(), result);
        assert!(registry.is_empty());

        let entry = store.read("page").unwrap().unwrap();
        assert_eq!(entry.value, Bytes::from_static(b"<html/>"));
        assert_eq!(
            entry.stale_until - entry.fresh_until,
            chrono::TimeDelta::seconds(300)
        );
    }

    #[tokio::test]
    async fn execute_converts_panics_and_evicts() {
        let store = store();
        let now = Utc::now();
        store.write("page", b"old", now, now).unwrap();

        let registry = CoalescingRegistry::new();
        let job = job(&registry, "page", || {
            async { exploding_template() }.boxed()
        });

        let result = execute(&store, job, RecreateMode::Background).await;
        assert_eq!(
            result,
            Err(CacheError::Panicked("template exploded".into()))
        );
        assert_eq!(store.read("page").unwrap(), None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let store = store();
        let registry = CoalescingRegistry::new();
        let shutdown = CancellationToken::new();
        let config = EngineConfig {
            general_workers: 2,
            general_queue_size: 1,
            ..Default::default()
        };
        let pool = WorkerPool::start(
            Arc::clone(&store),
            &config,
            &Handle::current(),
            shutdown.clone(),
        );

        let mut results = Vec::new();
        for i in 0..5 {
            let (done_tx, done_rx) = oneshot::channel();
            let mut job = job(&registry, &format!("page-{i}"), move || {
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    CacheResult::Ok(Bytes::from(format!("content {i}")))
                }
                .boxed()
            });
            job.done_tx = Some(done_tx);
            assert_eq!(pool.submit(job).await, Ok(QueueKind::General));
            results.push(done_rx);
        }

        for (i, done_rx) in results.into_iter().enumerate() {
            assert_eq!(done_rx.await.unwrap(), Ok(Bytes::from(format!("content {i}"))));
        }
        assert!(registry.is_empty());
        assert_eq!(pool.queued(QueueKind::General), 0);

        shutdown.cancel();
    }
}
