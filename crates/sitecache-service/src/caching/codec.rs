//! Encoding of keys, timestamps and values as they are persisted.
//!
//! # Keys
//!
//! All keys live in a handful of fixed prefixes:
//!
//! - `c:{key}`: a cache entry. Keys longer than [`MAX_VERBATIM_KEY_LEN`] bytes are stored as
//!   `c:{head}#{sha256}` instead, where `head` is the first 357 to 360 bytes of the key, so
//!   storage keys stay within the 511 byte limit of LMDB and prefix scans still find them.
//! - `expiry-index:{RFC 3339 timestamp}:{nonce}`: an expiry index key of the inverted-index
//!   layout, pointing back to the entry key. Timestamps are always UTC with millisecond
//!   precision, so they sort chronologically as bytes.
//! - `meta:snapshot`: the time of the last snapshot of the store.
//!
//! # Values
//!
//! An entry value starts with a fixed 26 byte header followed by the payload:
//!
//! | offset | size | content                                     |
//! |--------|------|---------------------------------------------|
//! | 0      | 1    | format version, currently `1`               |
//! | 1      | 1    | flags, bit 0 marks a zstd compressed payload |
//! | 2      | 8    | `fresh_until`, ms since the epoch, BE       |
//! | 10     | 8    | `stale_until`, ms since the epoch, BE       |
//! | 18     | 8    | nonce of the matching expiry index key, BE  |
//!
//! If flag bit 1 is set, the header is followed by the full cache key, as a 4 byte big-endian
//! length and the UTF-8 key. This is the case for all keys stored under a digest.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use sha2::{Digest, Sha256};

use crate::storage::{StorageError, StorageResult};
use crate::utils::compression::{compress_value, decompress_value};

pub const ENTRY_PREFIX: &str = "c:";
pub const EXPIRY_INDEX_PREFIX: &str = "expiry-index:";
pub const SNAPSHOT_MARKER_KEY: &str = "meta:snapshot";

const FORMAT_VERSION: u8 = 1;
const FLAG_ZSTD: u8 = 0b1;
const FLAG_FULL_KEY: u8 = 0b10;
const HEADER_LEN: usize = 26;

/// Keys up to this many bytes are stored verbatim.
pub const MAX_VERBATIM_KEY_LEN: usize = 400;
/// Bytes of a longer key kept in front of its digest, rounded down to a char boundary.
const DIGEST_HEAD_LEN: usize = 360;
/// Bytes of a key that always end up in its storage key, digest or not.
const ALWAYS_KEPT_LEN: usize = DIGEST_HEAD_LEN - 3;

/// The latest representable deadline, `9999-12-31T23:59:59.999Z`.
///
/// Later timestamps would no longer format to a fixed width.
pub fn max_timestamp() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(253_402_300_799_999).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Computes `start + duration`, saturating at [`max_timestamp`].
pub fn deadline_after(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .map_or_else(max_timestamp, |deadline| deadline.min(max_timestamp()))
}

/// The storage key of the entry for `key`.
pub fn entry_key(key: &str) -> Vec<u8> {
    if key.len() <= MAX_VERBATIM_KEY_LEN {
        return [ENTRY_PREFIX.as_bytes(), key.as_bytes()].concat();
    }
    let head = &key[..floor_char_boundary(key, DIGEST_HEAD_LEN)];
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    [ENTRY_PREFIX.as_bytes(), head.as_bytes(), b"#".as_slice(), digest.as_bytes()].concat()
}

/// Whether `storage_key` is an entry key made from a digest of the cache key.
///
/// Entries stored under such a key carry their full key, see [`EntryHeader::full_key`].
pub fn is_digest_key(storage_key: &[u8]) -> bool {
    storage_key.len() > ENTRY_PREFIX.len() + MAX_VERBATIM_KEY_LEN
}

/// The storage key prefix under which all entries with keys starting with `prefix` live.
///
/// The second value tells whether every entry under that prefix actually matches. It does not
/// for long prefixes, as digest keys only keep the head of the key.
pub fn entry_prefix(prefix: &str) -> (Vec<u8>, bool) {
    let kept = &prefix[..floor_char_boundary(prefix, ALWAYS_KEPT_LEN)];
    let exact = kept.len() == prefix.len();
    ([ENTRY_PREFIX.as_bytes(), kept.as_bytes()].concat(), exact)
}

/// Recovers the cache key from a verbatim entry storage key.
///
/// Returns `None` for anything else, including digest keys.
pub fn logical_key(storage_key: &[u8]) -> Option<&str> {
    if is_digest_key(storage_key) {
        return None;
    }
    let key = storage_key.strip_prefix(ENTRY_PREFIX.as_bytes())?;
    std::str::from_utf8(key).ok()
}

/// The largest char boundary of `s` that is `<= max`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

/// Formats a timestamp as fixed-width RFC 3339 in UTC.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The expiry index key for an entry expiring at `expire_at`.
pub fn index_key(expire_at: DateTime<Utc>, nonce: u64) -> Vec<u8> {
    format!(
        "{EXPIRY_INDEX_PREFIX}{}:{nonce:016x}",
        format_timestamp(expire_at)
    )
    .into_bytes()
}

/// Splits an expiry index key into its timestamp and nonce.
pub fn parse_index_key(raw: &[u8]) -> Option<(DateTime<Utc>, u64)> {
    let raw = std::str::from_utf8(raw).ok()?;
    let (timestamp, nonce) = raw.strip_prefix(EXPIRY_INDEX_PREFIX)?.rsplit_once(':')?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp).ok()?;
    let nonce = u64::from_str_radix(nonce, 16).ok()?;
    Some((timestamp.with_timezone(&Utc), nonce))
}

/// Encodes a timestamp as 8 bytes of big-endian milliseconds.
pub fn encode_timestamp(timestamp: DateTime<Utc>) -> [u8; 8] {
    timestamp.timestamp_millis().to_be_bytes()
}

pub fn decode_timestamp(raw: &[u8]) -> StorageResult<DateTime<Utc>> {
    let millis: [u8; 8] = raw
        .try_into()
        .map_err(|_| corrupted(format!("timestamp of {} bytes", raw.len())))?;
    let millis = i64::from_be_bytes(millis);
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| corrupted(format!("timestamp {millis} out of range")))
}

/// Deadlines and bookkeeping stored in front of every entry value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub fresh_until: DateTime<Utc>,
    pub stale_until: DateTime<Utc>,
    pub nonce: u64,
    pub compressed: bool,
    /// Length of the full key following the header, if it is stored.
    key_len: Option<u32>,
}

impl EntryHeader {
    /// The expiry index key pointing at this entry.
    pub fn index_key(&self) -> Vec<u8> {
        index_key(self.stale_until, self.nonce)
    }

    pub fn decode(raw: &[u8]) -> StorageResult<Self> {
        if raw.len() < HEADER_LEN {
            return Err(corrupted(format!("entry of {} bytes", raw.len())));
        }
        if raw[0] != FORMAT_VERSION {
            return Err(corrupted(format!("unknown entry format {}", raw[0])));
        }
        let key_len = if raw[1] & FLAG_FULL_KEY != 0 {
            let len = raw
                .get(HEADER_LEN..HEADER_LEN + 4)
                .and_then(|len| len.try_into().ok())
                .map(u32::from_be_bytes)
                .ok_or_else(|| corrupted("missing key length".to_owned()))?;
            if raw.len() < HEADER_LEN + 4 + len as usize {
                return Err(corrupted(format!("truncated key of {len} bytes")));
            }
            Some(len)
        } else {
            None
        };
        Ok(Self {
            compressed: raw[1] & FLAG_ZSTD != 0,
            fresh_until: decode_timestamp(&raw[2..10])?,
            stale_until: decode_timestamp(&raw[10..18])?,
            nonce: u64::from_be_bytes(raw[18..26].try_into().unwrap_or_default()),
            key_len,
        })
    }

    /// The full cache key stored in `raw`, the entry this header was decoded from.
    pub fn full_key<'a>(&self, raw: &'a [u8]) -> Option<&'a str> {
        let len = self.key_len? as usize;
        let key = raw.get(HEADER_LEN + 4..HEADER_LEN + 4 + len)?;
        std::str::from_utf8(key).ok()
    }

    fn payload_offset(&self) -> usize {
        match self.key_len {
            Some(len) => HEADER_LEN + 4 + len as usize,
            None => HEADER_LEN,
        }
    }
}

/// Deadlines and bookkeeping of an entry about to be written.
#[derive(Clone, Copy, Debug)]
pub struct NewEntry<'a> {
    pub fresh_until: DateTime<Utc>,
    pub stale_until: DateTime<Utc>,
    pub nonce: u64,
    /// The full cache key, for entries stored under a digest key.
    pub full_key: Option<&'a str>,
}

/// Encodes an entry, compressing the value if that is worthwhile.
pub fn encode_entry(
    entry: NewEntry<'_>,
    value: &[u8],
    compression_level: i32,
) -> StorageResult<Vec<u8>> {
    let compressed = compress_value(value, compression_level)?;
    let payload = compressed.as_deref().unwrap_or(value);
    let full_key = match entry.full_key {
        Some(key) => {
            let len = u32::try_from(key.len())
                .map_err(|_| corrupted(format!("key of {} bytes", key.len())))?;
            Some((len, key))
        }
        None => None,
    };

    let mut flags = 0;
    if compressed.is_some() {
        flags |= FLAG_ZSTD;
    }
    if full_key.is_some() {
        flags |= FLAG_FULL_KEY;
    }

    let key_bytes = full_key.map_or(0, |(_, key)| 4 + key.len());
    let mut raw = Vec::with_capacity(HEADER_LEN + key_bytes + payload.len());
    raw.push(FORMAT_VERSION);
    raw.push(flags);
    raw.extend_from_slice(&encode_timestamp(entry.fresh_until));
    raw.extend_from_slice(&encode_timestamp(entry.stale_until));
    raw.extend_from_slice(&entry.nonce.to_be_bytes());
    if let Some((len, key)) = full_key {
        raw.extend_from_slice(&len.to_be_bytes());
        raw.extend_from_slice(key.as_bytes());
    }
    raw.extend_from_slice(payload);
    Ok(raw)
}

/// Decodes an entry into its header and the decompressed value.
pub fn decode_entry(raw: &[u8]) -> StorageResult<(EntryHeader, Vec<u8>)> {
    let header = EntryHeader::decode(raw)?;
    let payload = &raw[header.payload_offset()..];
    let value = if header.compressed {
        decompress_value(payload)?
    } else {
        payload.to_vec()
    };
    Ok((header, value))
}

fn corrupted(details: String) -> StorageError {
    StorageError::Corrupted(details)
}
