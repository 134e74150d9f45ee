use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::codec::{
    self, EXPIRY_INDEX_PREFIX, EntryHeader, NewEntry, SNAPSHOT_MARKER_KEY, decode_entry,
    encode_entry, entry_key,
};
use crate::config::Config;
use crate::storage::{KvEngine, Layout, Namespace, StorageResult, WriteBatch, open_engine};

/// Freshness of an entry at a given point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Before `fresh_until`: served without side effects.
    Fresh,
    /// Between `fresh_until` and `stale_until`: served while a refresh runs in the background.
    Stale,
    /// Past `stale_until`: must be recreated before it can be served.
    Expired,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Fresh => "fresh",
            EntryState::Stale => "stale",
            EntryState::Expired => "expired",
        }
    }
}

/// A cache entry as read from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    /// Soft expiry: the value is authoritative before this.
    pub fresh_until: DateTime<Utc>,
    /// Hard expiry: the value must not be served after this.
    pub stale_until: DateTime<Utc>,
}

impl CacheEntry {
    pub fn state(&self, now: DateTime<Utc>) -> EntryState {
        if now < self.fresh_until {
            EntryState::Fresh
        } else if now < self.stale_until {
            EntryState::Stale
        } else {
            EntryState::Expired
        }
    }
}

/// Where a sweep or a prefix removal continues with its next batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepCursor {
    next_key: Option<Vec<u8>>,
}

/// Result of a single sweep or prefix removal batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepBatch {
    /// Number of entries removed.
    pub removed: usize,
    /// Whether there is nothing left to sweep in this run.
    pub done: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderLookup {
    Missing,
    Corrupted,
    Found(EntryHeader),
}

/// Cache entries on top of a [`KvEngine`], in one of the supported [`Layout`]s.
///
/// Reads and writes are synchronous and short, the engines only block for the duration of a
/// single transaction.
pub struct Store {
    engine: Box<dyn KvEngine>,
    layout: Layout,
    compression_level: i32,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("engine", &self.engine.name())
            .field("layout", &self.layout)
            .field("compression_level", &self.compression_level)
            .finish()
    }
}

impl Store {
    pub fn new(engine: Box<dyn KvEngine>, layout: Layout, compression_level: i32) -> Self {
        Self {
            engine,
            layout,
            compression_level,
        }
    }

    /// Opens the engine and layout selected by the configuration.
    pub fn open(config: &Config) -> StorageResult<Self> {
        let engine = open_engine(config)?;
        Ok(Self::new(
            engine,
            config.storage.layout(),
            config.storage.compression_level,
        ))
    }

    pub fn backend(&self) -> &'static str {
        self.engine.name()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn read(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        let storage_key = entry_key(key);
        let Some(raw) = self.engine.get(Namespace::Entries, &storage_key)? else {
            return Ok(None);
        };
        let (header, value) = match decode_entry(&raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                // treated as a miss, the next write replaces it
                metric!(counter("caches.entry.corrupted") += 1, "backend" => self.backend());
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    key,
                    "Ignoring undecodable cache entry"
                );
                return Ok(None);
            }
        };
        if codec::is_digest_key(&storage_key) && header.full_key(&raw) != Some(key) {
            tracing::warn!(key, "Ignoring cache entry of a different key with the same digest");
            return Ok(None);
        }
        metric!(time_raw("caches.entry.size") = raw.len() as u64, "backend" => self.backend());
        Ok(Some(CacheEntry {
            key: key.to_owned(),
            value: Bytes::from(value),
            fresh_until: header.fresh_until,
            stale_until: header.stale_until,
        }))
    }

    /// Writes an entry, replacing any previous entry for the same key.
    pub fn write(
        &self,
        key: &str,
        value: &[u8],
        fresh_until: DateTime<Utc>,
        stale_until: DateTime<Utc>,
    ) -> StorageResult<()> {
        let storage_key = entry_key(key);
        let entry = NewEntry {
            fresh_until,
            stale_until,
            nonce: rand::random(),
            full_key: codec::is_digest_key(&storage_key).then_some(key),
        };
        let raw = encode_entry(entry, value, self.compression_level)?;

        let mut batch = WriteBatch::new();
        match self.layout {
            Layout::TwinBucket => {
                batch.put(
                    Namespace::Expiry,
                    storage_key.clone(),
                    codec::encode_timestamp(stale_until),
                );
            }
            Layout::InvertedIndex => {
                if let HeaderLookup::Found(previous) = self.read_header(&storage_key)? {
                    batch.delete(Namespace::Entries, previous.index_key());
                }
                batch.put(
                    Namespace::Entries,
                    codec::index_key(stale_until, entry.nonce),
                    storage_key.clone(),
                );
            }
        }
        batch.put(Namespace::Entries, storage_key, raw);
        self.engine.write(batch)?;
        Ok(())
    }

    /// Removes the entry for `key`. Returns whether there was one.
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        let storage_key = entry_key(key);
        let header = self.read_header(&storage_key)?;
        if header == HeaderLookup::Missing {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        match (self.layout, header) {
            (Layout::TwinBucket, _) => batch.delete(Namespace::Expiry, storage_key.clone()),
            (Layout::InvertedIndex, HeaderLookup::Found(header)) => {
                batch.delete(Namespace::Entries, header.index_key())
            }
            // the dangling index key is dropped by the sweeper
            (Layout::InvertedIndex, _) => {}
        }
        batch.delete(Namespace::Entries, storage_key);
        self.engine.write(batch)?;
        Ok(true)
    }

    /// Iterates over all entries whose key starts with `prefix`, in storage key order.
    ///
    /// Entries that cannot be decoded are skipped.
    pub fn entries<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = StorageResult<CacheEntry>> + 'a {
        let (storage_prefix, _) = codec::entry_prefix(prefix);
        self.engine
            .scan(Namespace::Entries, &storage_prefix)
            .take_while(move |pair| match pair {
                Ok((storage_key, _)) => storage_key.starts_with(&storage_prefix),
                Err(_) => true,
            })
            .filter_map(move |pair| match pair {
                Ok((storage_key, raw)) => listed_entry(&storage_key, &raw, prefix).map(Ok),
                Err(err) => Some(Err(err)),
            })
    }

    /// Removes up to `batch_size` entries whose key starts with `prefix`, along with their
    /// expiry records, continuing where the previous batch of this removal ended.
    pub fn remove_prefix_batch(
        &self,
        prefix: &str,
        batch_size: usize,
        cursor: &mut SweepCursor,
    ) -> StorageResult<SweepBatch> {
        let (storage_prefix, exact) = codec::entry_prefix(prefix);
        let lower_bound = cursor
            .next_key
            .take()
            .unwrap_or_else(|| storage_prefix.clone());
        let page = self
            .engine
            .scan_from(Namespace::Entries, &lower_bound, batch_size)?;
        let mut done = page.len() < batch_size;

        let mut batch = WriteBatch::new();
        let mut removed = 0;
        for (storage_key, raw) in &page {
            if !storage_key.starts_with(&storage_prefix) {
                done = true;
                break;
            }
            // long prefixes also cover digest keys that only share the head of the prefix
            if !exact && listed_entry(storage_key, raw, prefix).is_none() {
                continue;
            }

            match (self.layout, EntryHeader::decode(raw)) {
                (Layout::TwinBucket, _) => batch.delete(Namespace::Expiry, storage_key.clone()),
                (Layout::InvertedIndex, Ok(header)) => {
                    batch.delete(Namespace::Entries, header.index_key())
                }
                // the dangling index key, if any, is dropped by the sweeper
                (Layout::InvertedIndex, Err(err)) => tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    key = %String::from_utf8_lossy(storage_key),
                    "Removing undecodable cache entry"
                ),
            }
            batch.delete(Namespace::Entries, storage_key.clone());
            removed += 1;
        }
        if !batch.is_empty() {
            self.engine.write(batch)?;
        }

        if !done {
            cursor.next_key = page.last().map(|(key, _)| successor(key));
        }
        Ok(SweepBatch { removed, done })
    }

    /// Removes a batch of entries that expired at or before `now`.
    ///
    /// Entries are only removed if they are unchanged since they were found to be expired, so
    /// an entry recreated concurrently survives the sweep.
    pub fn sweep_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        cursor: &mut SweepCursor,
    ) -> StorageResult<SweepBatch> {
        match self.layout {
            Layout::TwinBucket => self.sweep_twin_bucket(now, batch_size, cursor),
            Layout::InvertedIndex => self.sweep_inverted_index(now, batch_size),
        }
    }

    /// Timestamps are not part of the keys, so the whole expiry namespace is walked.
    fn sweep_twin_bucket(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        cursor: &mut SweepCursor,
    ) -> StorageResult<SweepBatch> {
        let lower_bound = cursor.next_key.take().unwrap_or_default();
        let page = self
            .engine
            .scan_from(Namespace::Expiry, &lower_bound, batch_size)?;
        let done = page.len() < batch_size;

        let mut batch = WriteBatch::new();
        let mut dangling = WriteBatch::new();
        let mut candidates = 0;
        for (storage_key, raw_expiry) in &page {
            let expired = match codec::decode_timestamp(raw_expiry) {
                Ok(stale_until) => stale_until <= now,
                Err(_) => true,
            };
            if !expired {
                continue;
            }

            let keys = vec![(Namespace::Expiry, storage_key.clone())];
            let Some(raw) = self.engine.get(Namespace::Entries, storage_key)? else {
                dangling.delete_if_unchanged(
                    Namespace::Expiry,
                    storage_key.clone(),
                    raw_expiry.clone(),
                    keys,
                );
                continue;
            };
            // rewritten since the expiry page was read
            if matches!(EntryHeader::decode(&raw), Ok(header) if header.stale_until > now) {
                continue;
            }
            let mut keys = keys;
            keys.push((Namespace::Entries, storage_key.clone()));
            batch.delete_if_unchanged(Namespace::Entries, storage_key.clone(), raw, keys);
            candidates += 1;
        }

        let removed = self.write_guarded(batch, candidates)?;
        if !dangling.is_empty() {
            self.engine.write(dangling)?;
        }

        if !done {
            cursor.next_key = page.last().map(|(key, _)| successor(key));
        }
        Ok(SweepBatch { removed, done })
    }

    /// Walks the expiry index oldest first and stops at the first timestamp after `now`.
    fn sweep_inverted_index(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> StorageResult<SweepBatch> {
        let page = self.engine.scan_from(
            Namespace::Entries,
            EXPIRY_INDEX_PREFIX.as_bytes(),
            batch_size,
        )?;
        let mut done = page.len() < batch_size;

        let mut batch = WriteBatch::new();
        let mut candidates = 0;
        for (index_key, storage_key) in page {
            if !index_key.starts_with(EXPIRY_INDEX_PREFIX.as_bytes()) {
                done = true;
                break;
            }
            let Some((expire_at, nonce)) = codec::parse_index_key(&index_key) else {
                tracing::warn!(
                    key = %String::from_utf8_lossy(&index_key),
                    "Dropping malformed expiry index key"
                );
                batch.delete(Namespace::Entries, index_key);
                continue;
            };
            if expire_at > now {
                done = true;
                break;
            }

            // Index keys of overwritten entries may linger, only remove the entry this
            // index key was written for.
            if let Some(raw) = self.engine.get(Namespace::Entries, &storage_key)? {
                let owned = match EntryHeader::decode(&raw) {
                    Ok(header) => header.nonce == nonce,
                    Err(_) => true,
                };
                if owned {
                    let keys = vec![(Namespace::Entries, storage_key.clone())];
                    batch.delete_if_unchanged(Namespace::Entries, storage_key, raw, keys);
                    candidates += 1;
                }
            }
            batch.delete(Namespace::Entries, index_key);
        }
        if batch.is_empty() {
            done = true;
        }
        let removed = self.write_guarded(batch, candidates)?;
        Ok(SweepBatch { removed, done })
    }

    /// Writes a batch of `candidates` guarded deletes, returning how many of them applied.
    fn write_guarded(&self, batch: WriteBatch, candidates: usize) -> StorageResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let skipped = self.engine.write(batch)?;
        if skipped > 0 {
            tracing::debug!(skipped, "Kept cache entries rewritten during the sweep");
        }
        Ok(candidates.saturating_sub(skipped))
    }

    /// Records the time of the last snapshot of this store.
    pub fn record_snapshot(&self, at: DateTime<Utc>) -> StorageResult<()> {
        self.engine.set(
            Namespace::Entries,
            SNAPSHOT_MARKER_KEY.as_bytes(),
            &codec::encode_timestamp(at),
        )
    }

    pub fn last_snapshot(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.engine
            .get(Namespace::Entries, SNAPSHOT_MARKER_KEY.as_bytes())?
            .map(|raw| codec::decode_timestamp(&raw))
            .transpose()
    }

    fn read_header(&self, storage_key: &[u8]) -> StorageResult<HeaderLookup> {
        Ok(match self.engine.get(Namespace::Entries, storage_key)? {
            None => HeaderLookup::Missing,
            Some(raw) => match EntryHeader::decode(&raw) {
                Ok(header) => HeaderLookup::Found(header),
                Err(_) => HeaderLookup::Corrupted,
            },
        })
    }
}

/// The smallest key strictly greater than `key`.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// Decodes a listed entry if its full key starts with `prefix`.
fn listed_entry(storage_key: &[u8], raw: &[u8], prefix: &str) -> Option<CacheEntry> {
    let (header, value) = decode_entry(raw).ok()?;
    let key = if codec::is_digest_key(storage_key) {
        header.full_key(raw)?
    } else {
        codec::logical_key(storage_key)?
    };
    key.starts_with(prefix).then(|| CacheEntry {
        key: key.to_owned(),
        value: Bytes::from(value),
        fresh_until: header.fresh_until,
        stale_until: header.stale_until,
    })
}
