//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sitecache_service::config::Config;
use sitecache_service::metrics;

use crate::cache;
use crate::logging;
use crate::service;

/// Sitecache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Open the cache and sweep expired entries until interrupted.
    Run,

    /// Remove all expired entries once.
    Cleanup,

    /// Remove all entries whose key starts with the given prefix.
    Clear {
        /// Key prefix, for example `topcat:site.com:`.
        prefix: String,
    },

    /// Show the freshness, deadlines and size of a single entry.
    Inspect {
        /// The full cache key.
        key: String,
    },

    /// List the entries whose key starts with the given prefix.
    List {
        /// Key prefix, lists everything if omitted.
        #[arg(default_value = "")]
        prefix: String,

        /// Stop after this many entries.
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "sitecache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is created further down, this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, hostname);
            }
        }
        if let Some(tag) = config.metrics.environment_tag.clone() {
            if let Some(environment) = sentry.options().environment.as_ref() {
                tags.insert(tag, environment.to_string());
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("sitecache")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    match cli.command {
        Command::Run => service::run(config, &runtime).context("failed to run the cache engine")?,
        Command::Cleanup => {
            cache::cleanup(config, &runtime).context("failed to clean up the cache")?
        }
        Command::Clear { prefix } => {
            cache::clear(config, &prefix, &runtime).context("failed to clear the cache")?
        }
        Command::Inspect { key } => {
            cache::inspect(&config, &key).context("failed to inspect the cache")?
        }
        Command::List { prefix, limit } => {
            cache::list(&config, &prefix, limit).context("failed to list the cache")?
        }
    }

    Ok(())
}
