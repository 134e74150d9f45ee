use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::storage::Layout;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for sitecache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "sitecache".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The embedded key-value engine backing the cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// A single `redb` database file.
    Redb,
    /// An LMDB environment, accessed through `heed`.
    Lmdb,
    /// A single SQLite database file, accessed through `rusqlite`.
    Sqlite,
    /// Process memory only. Nothing survives a restart.
    Memory,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Redb => "redb",
            Backend::Lmdb => "lmdb",
            Backend::Sqlite => "sqlite",
            Backend::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configures the persistent store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Which engine to use.
    ///
    /// Without a `cache_dir` this is ignored and the memory engine is used.
    pub backend: Backend,

    /// How entries and their expiry are laid out in the engine.
    ///
    /// Defaults to `twin_bucket` for redb and `inverted_index` for the other engines.
    pub layout: Option<Layout>,

    /// zstd level used to compress stored values.
    pub compression_level: i32,

    /// Maximum size of the LMDB memory map, in bytes.
    ///
    /// Defaults to `4 GiB`. Capped to the address space on 32-bit targets.
    pub lmdb_map_size: u64,
}

impl StorageConfig {
    /// The layout in effect, after applying the per-engine default.
    pub fn layout(&self) -> Layout {
        self.layout.unwrap_or(match self.backend {
            Backend::Redb => Layout::TwinBucket,
            Backend::Lmdb | Backend::Sqlite | Backend::Memory => Layout::InvertedIndex,
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Redb,
            layout: None,
            compression_level: 3,
            lmdb_map_size: 4 << 30,
        }
    }
}

/// Fine-tuning of the recreation engine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of recreations running concurrently from the general queue.
    pub general_workers: usize,

    /// Number of recreations running concurrently from the inner queue.
    pub inner_workers: usize,

    /// Capacity of the general queue. Producers wait once it is full.
    pub general_queue_size: usize,

    /// Capacity of the inner queue. Producers wait once it is full.
    pub inner_queue_size: usize,

    /// Keys starting with this prefix are recreated on the inner queue.
    ///
    /// These are small internal lookups which must not starve behind large page renders.
    pub inner_key_prefix: String,

    /// Waiting on a recreation for longer than this logs a warning.
    ///
    /// This is purely informational, the wait is never cancelled.
    #[serde(with = "humantime_serde")]
    pub slow_recreation_warning: Duration,

    /// Upper bound between two checks while waiting for a recreation of the same key that is
    /// already running.
    #[serde(with = "humantime_serde")]
    pub coalescing_poll_interval: Duration,

    /// Number of keys deleted per batch when clearing a prefix.
    ///
    /// Clamped to `1_000..=10_000`.
    pub prefix_delete_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            general_workers: 16,
            inner_workers: 8,
            general_queue_size: 1024,
            inner_queue_size: 1024,
            inner_key_prefix: "in:".into(),
            slow_recreation_warning: Duration::from_secs(5),
            coalescing_poll_interval: Duration::from_millis(10),
            prefix_delete_batch_size: 5_000,
        }
    }
}

/// Configures the background sweeper removing expired entries.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SweeperConfig {
    /// Whether the engine runs the sweeper at all.
    pub enabled: bool,

    /// Base time between two sweeps.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound of the random delay added to every interval.
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,

    /// Number of expired entries removed per batch before yielding.
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(30),
            batch_size: 1_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the persistent store. Default is to keep the cache in memory.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Selects and tunes the storage engine.
    pub storage: StorageConfig,

    /// Worker pools, queues and coalescing.
    pub engine: EngineConfig,

    /// Removal of expired entries.
    pub sweeper: SweeperConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The engine actually used: memory when no `cache_dir` is configured.
    pub fn backend(&self) -> Backend {
        match self.cache_dir {
            Some(_) => self.storage.backend,
            None => Backend::Memory,
        }
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
