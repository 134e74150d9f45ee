//! Uniform access to the embedded key-value engines.
//!
//! Every engine exposes the same small set of primitives through [`KvEngine`]: point reads,
//! atomic [`WriteBatch`]es, prefix deletion and ordered scans from a lower bound. Keys are
//! compared bytewise. Engines know nothing about cache entries or expiry, that is layered on
//! top by [`Store`](crate::caching::Store).
//!
//! Each engine provides two [`Namespace`]s. Which of them are used depends on the [`Layout`].

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::config::{Backend, Config};

#[cfg(feature = "lmdb")]
mod lmdb;
mod memory;
#[cfg(feature = "redb")]
mod redb_engine;
#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "lmdb")]
pub use lmdb::LmdbEngine;
pub use memory::MemoryEngine;
#[cfg(feature = "redb")]
pub use redb_engine::RedbEngine;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEngine;

/// File name of the redb database inside the cache directory.
pub const REDB_FILE_NAME: &str = "sitecache.redb";
/// Directory of the LMDB environment inside the cache directory.
pub const LMDB_DIR_NAME: &str = "lmdb";
/// File name of the SQLite database inside the cache directory.
pub const SQLITE_FILE_NAME: &str = "sitecache.sqlite";

/// A separately keyed collection of keys inside one engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Namespace {
    /// Cache entries, plus the expiry index and marker keys where the layout keeps them inline.
    Entries,
    /// Hard-expiry timestamps keyed like the entries, used by the twin-bucket layout.
    Expiry,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Entries, Namespace::Expiry];

    pub fn name(&self) -> &'static str {
        match self {
            Namespace::Entries => "entries",
            Namespace::Expiry => "expiry",
        }
    }

    fn index(&self) -> usize {
        match self {
            Namespace::Entries => 0,
            Namespace::Expiry => 1,
        }
    }
}

/// Physical arrangement of entries and their expiry timestamps.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Values in [`Namespace::Entries`] and expiry timestamps in [`Namespace::Expiry`], keyed
    /// identically. Sweeping scans every timestamp.
    TwinBucket,
    /// A single namespace holding values and a time-ordered `expiry-index:` key per value.
    /// Sweeping stops at the first index key in the future.
    InvertedIndex,
}

impl Layout {
    pub fn name(&self) -> &'static str {
        match self {
            Layout::TwinBucket => "twin_bucket",
            Layout::InvertedIndex => "inverted_index",
        }
    }
}

/// Errors raised by the storage engines.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[cfg(feature = "redb")]
    #[error("redb error: {0}")]
    Redb(#[from] ::redb::Error),
    #[cfg(feature = "lmdb")]
    #[error("lmdb error: {0}")]
    Lmdb(#[from] heed::Error),
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupted record: {0}")]
    Corrupted(String),
    #[error("storage backend `{0}` is not available in this build")]
    Unavailable(&'static str),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A key and its value, as returned by scans.
pub type KvPair = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        namespace: Namespace,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        namespace: Namespace,
        key: Vec<u8>,
    },
    /// Deletes `keys` only if `guard` still holds its expected value when the batch is applied.
    DeleteIfUnchanged { guard: Guard, keys: Vec<NamespacedKey> },
}

/// A key in a specific namespace.
pub type NamespacedKey = (Namespace, Vec<u8>);

/// The value a key is expected to hold for a [`WriteOp::DeleteIfUnchanged`] to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub namespace: Namespace,
    pub key: Vec<u8>,
    pub expected: Vec<u8>,
}

impl Guard {
    /// Whether `current`, the value read inside the write transaction, still matches.
    pub fn holds(&self, current: Option<&[u8]>) -> bool {
        current == Some(self.expected.as_slice())
    }
}

/// A set of writes applied atomically by [`KvEngine::write`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &mut self,
        namespace: Namespace,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) {
        self.ops.push(WriteOp::Put {
            namespace,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, namespace: Namespace, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            namespace,
            key: key.into(),
        });
    }

    /// Deletes `keys` unless the value of `guard_key` changed since it was read as `expected`.
    ///
    /// The comparison happens inside the transaction applying the batch, so a concurrent write
    /// of the guarded key either lands before it and keeps the keys alive, or after it.
    pub fn delete_if_unchanged(
        &mut self,
        guard_namespace: Namespace,
        guard_key: impl Into<Vec<u8>>,
        expected: impl Into<Vec<u8>>,
        keys: Vec<NamespacedKey>,
    ) {
        self.ops.push(WriteOp::DeleteIfUnchanged {
            guard: Guard {
                namespace: guard_namespace,
                key: guard_key.into(),
                expected: expected.into(),
            },
            keys,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = WriteOp;
    type IntoIter = std::vec::IntoIter<WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// An embedded, ordered key-value engine.
pub trait KvEngine: Send + Sync + 'static {
    /// A short name used in logs and metrics.
    fn name(&self) -> &'static str;

    fn get(&self, namespace: Namespace, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Applies all operations of the batch in a single transaction.
    ///
    /// Returns the number of [`WriteOp::DeleteIfUnchanged`] operations that were skipped because
    /// their guard no longer matched.
    fn write(&self, batch: WriteBatch) -> StorageResult<usize>;

    /// Returns up to `limit` pairs with keys `>= lower_bound`, in ascending key order.
    fn scan_from(
        &self,
        namespace: Namespace,
        lower_bound: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<KvPair>>;

    fn set(&self, namespace: Namespace, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(namespace, key, value);
        self.write(batch).map(drop)
    }

    fn delete(&self, namespace: Namespace, key: &[u8]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(namespace, key);
        self.write(batch).map(drop)
    }

    /// Deletes up to `limit` keys starting with `prefix` and returns how many were deleted.
    ///
    /// A return value equal to `limit` means more matching keys may remain.
    fn delete_prefix(
        &self,
        namespace: Namespace,
        prefix: &[u8],
        limit: usize,
    ) -> StorageResult<usize> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.scan_from(namespace, prefix, limit)? {
            if !key.starts_with(prefix) {
                break;
            }
            batch.delete(namespace, key);
        }
        let deleted = batch.len();
        if deleted > 0 {
            self.write(batch)?;
        }
        Ok(deleted)
    }
}

impl dyn KvEngine {
    /// Iterates over all pairs with keys `>= lower_bound`, fetching them in pages.
    ///
    /// Every page is read in its own transaction, so concurrent writes may or may not be
    /// observed by later pages.
    pub fn scan(&self, namespace: Namespace, lower_bound: &[u8]) -> Scan<'_> {
        Scan {
            engine: self,
            namespace,
            next_bound: Some(lower_bound.to_vec()),
            buffer: VecDeque::new(),
        }
    }
}

/// Number of pairs fetched per page by [`Scan`].
const SCAN_PAGE_SIZE: usize = 256;

/// Iterator returned by `dyn KvEngine::scan`.
pub struct Scan<'a> {
    engine: &'a dyn KvEngine,
    namespace: Namespace,
    /// `None` once the engine returned a short page, or after an error.
    next_bound: Option<Vec<u8>>,
    buffer: VecDeque<KvPair>,
}

impl Iterator for Scan<'_> {
    type Item = StorageResult<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(pair) = self.buffer.pop_front() {
            return Some(Ok(pair));
        }

        let bound = self.next_bound.take()?;
        match self.engine.scan_from(self.namespace, &bound, SCAN_PAGE_SIZE) {
            Ok(page) => {
                if page.len() == SCAN_PAGE_SIZE {
                    // the smallest key strictly greater than the last one
                    self.next_bound = page.last().map(|(key, _)| {
                        let mut next = key.clone();
                        next.push(0);
                        next
                    });
                }
                self.buffer.extend(page);
                self.buffer.pop_front().map(Ok)
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Opens the engine selected by the configuration.
///
/// Without a `cache_dir`, this always returns an empty [`MemoryEngine`].
pub fn open_engine(config: &Config) -> StorageResult<Box<dyn KvEngine>> {
    let Some(cache_dir) = config.cache_dir.as_deref() else {
        return Ok(Box::new(MemoryEngine::new()));
    };

    let engine = match config.backend() {
        Backend::Memory => Box::new(MemoryEngine::new()) as Box<dyn KvEngine>,
        Backend::Redb => open_redb(cache_dir)?,
        Backend::Lmdb => open_lmdb(cache_dir, config.storage.lmdb_map_size)?,
        Backend::Sqlite => open_sqlite(cache_dir)?,
    };
    tracing::info!(
        backend = engine.name(),
        path = %cache_dir.display(),
        "Opened cache storage"
    );
    Ok(engine)
}

#[cfg(feature = "redb")]
fn open_redb(cache_dir: &Path) -> StorageResult<Box<dyn KvEngine>> {
    Ok(Box::new(RedbEngine::open(&cache_dir.join(REDB_FILE_NAME))?))
}

#[cfg(not(feature = "redb"))]
fn open_redb(_cache_dir: &Path) -> StorageResult<Box<dyn KvEngine>> {
    Err(StorageError::Unavailable("redb"))
}

#[cfg(feature = "lmdb")]
fn open_lmdb(cache_dir: &Path, map_size: u64) -> StorageResult<Box<dyn KvEngine>> {
    let map_size = usize::try_from(map_size).unwrap_or(usize::MAX);
    Ok(Box::new(LmdbEngine::open(
        &cache_dir.join(LMDB_DIR_NAME),
        map_size,
    )?))
}

#[cfg(not(feature = "lmdb"))]
fn open_lmdb(_cache_dir: &Path, _map_size: u64) -> StorageResult<Box<dyn KvEngine>> {
    Err(StorageError::Unavailable("lmdb"))
}

#[cfg(feature = "sqlite")]
fn open_sqlite(cache_dir: &Path) -> StorageResult<Box<dyn KvEngine>> {
    Ok(Box::new(SqliteEngine::open(&cache_dir.join(SQLITE_FILE_NAME))?))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_cache_dir: &Path) -> StorageResult<Box<dyn KvEngine>> {
    Err(StorageError::Unavailable("sqlite"))
}
