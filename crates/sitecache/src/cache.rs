//! Maintenance commands operating on the configured cache.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use console::style;
use sitecache_service::caching::{CacheEngine, EntryState, Store, Sweeper, codec};
use sitecache_service::config::Config;
use tokio::runtime::Runtime;

fn open_store(config: &Config) -> Result<Arc<Store>> {
    let store = Store::open(config)
        .with_context(|| format!("failed to open the {} cache", config.backend()))?;
    Ok(Arc::new(store))
}

/// Removes every entry past its hard expiry.
pub fn cleanup(config: Config, runtime: &Runtime) -> Result<()> {
    let store = open_store(&config)?;
    let sweeper = Sweeper::new(store, Default::default(), config.sweeper);
    let stats = runtime.block_on(sweeper.run_once())?;
    println!(
        "removed {} expired entries in {}",
        stats.removed,
        humantime::format_duration(stats.duration)
    );
    Ok(())
}

/// Removes every entry whose key starts with `prefix`.
pub fn clear(config: Config, prefix: &str, runtime: &Runtime) -> Result<()> {
    let store = open_store(&config)?;
    let engine = CacheEngine::new(store, config.engine, runtime.handle());
    let removed = runtime.block_on(engine.clear_cache_by_prefix(prefix));
    engine.shutdown();

    println!("removed {} entries starting with {prefix:?}", removed?);
    Ok(())
}

/// Prints the state of the entry for `key`.
pub fn inspect(config: &Config, key: &str) -> Result<()> {
    let store = open_store(config)?;
    let Some(entry) = store.read(key)? else {
        println!("{}: not cached", style(key).bold());
        return Ok(());
    };

    let now = Utc::now();
    println!("{}: {}", style(key).bold(), styled_state(entry.state(now)));
    println!(
        "  fresh until: {} ({})",
        codec::format_timestamp(entry.fresh_until),
        relative_to(entry.fresh_until, now)
    );
    println!(
        "  stale until: {} ({})",
        codec::format_timestamp(entry.stale_until),
        relative_to(entry.stale_until, now)
    );
    println!("  size:        {} bytes", entry.value.len());

    if let Some(taken_at) = store.last_snapshot()? {
        println!("last snapshot: {}", codec::format_timestamp(taken_at));
    }
    Ok(())
}

/// Prints one line per entry whose key starts with `prefix`, at most `limit` of them.
pub fn list(config: &Config, prefix: &str, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let now = Utc::now();
    let mut listed = 0;
    for entry in store.entries(prefix).take(limit) {
        let entry = entry?;
        println!(
            "{} {} (stale {}, {} bytes)",
            styled_state(entry.state(now)),
            entry.key,
            relative_to(entry.stale_until, now),
            entry.value.len()
        );
        listed += 1;
    }
    if listed == limit {
        println!("{}", style(format!("stopped after {limit} entries")).dim());
    }
    Ok(())
}

fn styled_state(state: EntryState) -> console::StyledObject<&'static str> {
    match state {
        EntryState::Fresh => style(state.as_str()).green(),
        EntryState::Stale => style(state.as_str()).yellow(),
        EntryState::Expired => style(state.as_str()).red(),
    }
}

/// Describes `deadline` relative to `now` in whole seconds, e.g. `in 4m 30s` or `10s ago`.
fn relative_to(deadline: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let whole_seconds = |delta: chrono::TimeDelta| {
        let delta = delta.to_std().unwrap_or_default();
        humantime::format_duration(Duration::from_secs(delta.as_secs()))
    };
    if deadline > now {
        format!("in {}", whole_seconds(deadline - now))
    } else {
        format!("{} ago", whole_seconds(now - deadline))
    }
}
