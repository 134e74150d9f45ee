//! # Sitecache caching infrastructure
//!
//! Rendering a page means fetching page data from a remote API, which is slow and occasionally
//! fails. Sites are therefore served out of a local, persistent cache, and this module contains
//! the engine that keeps that cache filled: the [`CacheEngine`].
//!
//! ## Freshness
//!
//! Every [`CacheEntry`] carries two deadlines:
//!
//! - `fresh_until`: before this, the value is served as is.
//! - `stale_until`: between the two deadlines, the value is still served, but a recreation is
//!   scheduled in the background. Past this, the value is never served again.
//!
//! Both are computed when the entry is written, from the `fresh_timeout` and `extended_timeout`
//! of the request that recreated it: `stale_until = fresh_until + extended_timeout`. An
//! `extended_timeout` of zero therefore means the entry is never served stale.
//!
//! A request goes through the following steps in [`CacheEngine::get_cached_timeout`]:
//! - A fresh entry is returned directly, without any other side effect.
//! - A stale entry is returned directly, and a background recreation is queued unless one is
//!   already running for that key.
//! - Otherwise, the entry is recreated and the caller waits for it. If a recreation of that
//!   key is already running, the caller waits for that one instead, and receives its outcome.
//!
//! A failed recreation removes the entry it was supposed to replace, so an entry that keeps
//! failing turns into a miss instead of being served forever.
//!
//! ## Coalescing
//!
//! The [`CoalescingRegistry`] holds every key currently being recreated. Registering a key yields
//! an [`InFlightGuard`], which is dropped once the recreation completes, fails, panics or is
//! cancelled, so a key can never stay registered forever. Everybody else gets an
//! [`InFlightWaiter`] which is woken up with the outcome of the running recreation.
//!
//! ## Recreation queues
//!
//! Recreations that can be served stale run on one of two bounded queues, each drained by a fixed
//! number of workers. Keys starting with the `inner_key_prefix` (`in:` by default) go to the inner
//! queue, which is reserved for small internal lookups so that they never starve behind large
//! page renders. A full queue makes the caller wait until there is room again.
//!
//! Recreations without any stale period run directly on the calling task.
//!
//! ## Storage
//!
//! The [`Store`] persists entries in one of the [`KvEngine`](crate::storage::KvEngine)s, using
//! one of two [`Layout`](crate::storage::Layout)s. See the [`codec`] module for the exact format
//! of keys and values. Entries past their hard expiry are removed by the [`Sweeper`].
//!
//! ### Metrics
//!
//! Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.hit`: Accesses served from the store, tagged with the `state` of the entry.
//! - `caches.miss`: Accesses which had to recreate the entry.
//! - `caches.coalesced`: Accesses waiting for a recreation started by another caller.
//! - `caches.recreate`: Recreations being run, tagged with their `mode`: `inline`, `queued` or
//!   `background`.
//! - `caches.recreate.error`: Failed recreations, tagged with the kind of `error`.
//! - `caches.recreate.duration`: How long recreations took.
//! - `caches.queue.capacity`: Free room in the recreation queues.
//! - `caches.clear.removed` and `caches.sweep.removed`: Entries removed by prefix deletion and by
//!   the sweeper.
//!
//! ### Configuration
//!
//! Without a [`Config::cache_dir`](crate::config::Config::cache_dir), entries are kept in memory
//! and are lost on restart. Queue sizes, worker counts and the inner key prefix live in
//! [`EngineConfig`](crate::config::EngineConfig), the sweeper schedule in
//! [`SweeperConfig`](crate::config::SweeperConfig).

mod cache_error;
pub mod codec;
mod engine;
mod registry;
mod store;
mod sweeper;
mod workers;

pub use cache_error::{CacheError, CacheResult};
pub use engine::CacheEngine;
pub use registry::{CoalescingRegistry, InFlightGuard, InFlightWaiter, Registration};
pub use store::{CacheEntry, EntryState, Store, SweepBatch, SweepCursor};
pub use sweeper::{SweepStats, Sweeper};
pub use workers::QueueKind;
