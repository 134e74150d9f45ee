use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::CacheResult;

/// What a finished recreation publishes to the callers waiting on it.
///
/// `None` while running, and also if the recreation was dropped without finishing.
type Outcome = Option<CacheResult>;

struct InFlight {
    started: Instant,
    outcome: watch::Receiver<Outcome>,
}

/// The set of keys that are currently being recreated.
///
/// At most one recreation per key is registered at any time. The caller that registers a key
/// holds an [`InFlightGuard`] and must publish its outcome through it, everybody else gets an
/// [`InFlightWaiter`] to wait on.
#[derive(Default)]
pub struct CoalescingRegistry {
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl fmt::Debug for CoalescingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

/// The result of [`CoalescingRegistry::register`].
#[derive(Debug)]
pub enum Registration {
    /// The key was free and is now registered to the caller.
    Acquired(InFlightGuard),
    /// Another recreation of the key is already running.
    Busy(InFlightWaiter),
}

impl CoalescingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        // the map stays consistent even if a holder panicked
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a recreation of `key`, unless one is already running.
    pub fn register(self: &Arc<Self>, key: &str) -> Registration {
        let mut in_flight = self.lock();
        if let Some(running) = in_flight.get(key) {
            return Registration::Busy(InFlightWaiter {
                key: key.to_owned(),
                started: running.started,
                outcome: running.outcome.clone(),
                registry: Arc::clone(self),
            });
        }

        let (tx, rx) = watch::channel(None);
        in_flight.insert(
            key.to_owned(),
            InFlight {
                started: Instant::now(),
                outcome: rx,
            },
        );
        Registration::Acquired(InFlightGuard {
            key: key.to_owned(),
            registry: Arc::clone(self),
            outcome: tx,
        })
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The keys currently being recreated, with how long each has been running.
    pub fn running(&self) -> Vec<(String, Duration)> {
        let mut running: Vec<_> = self
            .lock()
            .iter()
            .map(|(key, in_flight)| (key.clone(), in_flight.started.elapsed()))
            .collect();
        running.sort_by(|a, b| b.1.cmp(&a.1));
        running
    }

    /// Whether `outcome` still belongs to the registration of `key`.
    fn is_current(&self, key: &str, outcome: &watch::Receiver<Outcome>) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|in_flight| in_flight.outcome.same_channel(outcome))
    }
}

/// Proof of being the only recreation of a key.
///
/// Dropping the guard unregisters the key, including when the holder panics or its future is
/// cancelled. Waiters then observe the outcome published through [`complete`](Self::complete),
/// or no outcome at all.
pub struct InFlightGuard {
    key: String,
    registry: Arc<CoalescingRegistry>,
    outcome: watch::Sender<Outcome>,
}

impl fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("key", &self.key)
            .finish()
    }
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Hands the outcome to every waiter and unregisters the key.
    pub fn complete(self, outcome: &CacheResult) {
        self.outcome.send_replace(Some(outcome.clone()));
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// A handle to wait for a recreation started by somebody else.
pub struct InFlightWaiter {
    key: String,
    started: Instant,
    outcome: watch::Receiver<Outcome>,
    registry: Arc<CoalescingRegistry>,
}

impl fmt::Debug for InFlightWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightWaiter")
            .field("key", &self.key)
            .field("running_for", &self.started.elapsed())
            .finish()
    }
}

impl InFlightWaiter {
    /// Waits until the running recreation is unregistered.
    ///
    /// Returns the outcome it published, or `None` if it went away without one. Every
    /// `poll_interval`, the registry is consulted directly in case the completion signal was
    /// missed.
    pub async fn wait(mut self, poll_interval: Duration) -> Option<CacheResult> {
        loop {
            match tokio::time::timeout(poll_interval, self.outcome.changed()).await {
                Ok(Ok(())) => {
                    if let Some(outcome) = self.outcome.borrow_and_update().clone() {
                        return Some(outcome);
                    }
                }
                // the guard is gone, with or without publishing something
                Ok(Err(_)) => return self.outcome.borrow().clone(),
                Err(_) => {
                    if !self.registry.is_current(&self.key, &self.outcome) {
                        return self.outcome.borrow().clone();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::caching::CacheError;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn one_registration_per_key() {
        let registry = CoalescingRegistry::new();

        let Registration::Acquired(guard) = registry.register("topcat:site.com:en") else {
            panic!("first registration must succeed");
        };
        assert!(matches!(
            registry.register("topcat:site.com:en"),
            Registration::Busy(_)
        ));
        // unrelated keys are independent
        assert!(matches!(
            registry.register("topcat:site.com:de"),
            Registration::Acquired(_)
        ));
        assert_eq!(registry.len(), 1);

        drop(guard);
        assert!(!registry.is_registered("topcat:site.com:en"));
        assert!(matches!(
            registry.register("topcat:site.com:en"),
            Registration::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn waiters_receive_the_outcome() {
        let registry = CoalescingRegistry::new();
        let Registration::Acquired(guard) = registry.register("page") else {
            panic!("first registration must succeed");
        };
        let Registration::Busy(first) = registry.register("page") else {
            panic!("key is registered");
        };
        let Registration::Busy(second) = registry.register("page") else {
            panic!("key is registered");
        };

        let completer = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            guard.complete(&Ok(Bytes::from_static(b"rendered")));
        };
        let (first, second, ()) = tokio::join!(first.wait(POLL), second.wait(POLL), completer);

        assert_eq!(first, Some(Ok(Bytes::from_static(b"rendered"))));
        assert_eq!(second, Some(Ok(Bytes::from_static(b"rendered"))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn errors_are_shared_too() {
        let registry = CoalescingRegistry::new();
        let Registration::Acquired(guard) = registry.register("page") else {
            panic!("first registration must succeed");
        };
        let Registration::Busy(waiter) = registry.register("page") else {
            panic!("key is registered");
        };

        guard.complete(&Err(CacheError::NotFound));
        assert_eq!(waiter.wait(POLL).await, Some(Err(CacheError::NotFound)));
    }

    #[tokio::test]
    async fn dropped_guard_releases_waiters() {
        let registry = CoalescingRegistry::new();
        let Registration::Acquired(guard) = registry.register("page") else {
            panic!("first registration must succeed");
        };
        let Registration::Busy(waiter) = registry.register("page") else {
            panic!("key is registered");
        };

        let holder = tokio::spawn(async move {
            let _guard = guard;
            panic!("recreation blew up");
        });
        assert!(holder.await.unwrap_err().is_panic());

        assert_eq!(waiter.wait(POLL).await, None);
        assert!(!registry.is_registered("page"));
    }
}
