use anyhow::{Context, Result};
use sitecache_service::caching::CacheEngine;
use sitecache_service::config::Config;
use tokio::runtime::Runtime;

/// Starts the cache engine and keeps it running until Ctrl-C is pressed.
pub fn run(config: Config, runtime: &Runtime) -> Result<()> {
    if !config.sweeper.enabled {
        tracing::warn!("Sweeper is disabled, expired entries stay on disk until overwritten");
    }

    runtime.block_on(async {
        let engine = CacheEngine::start(&config, runtime.handle())
            .context("failed to open the cache")?;
        tracing::info!(
            backend = engine.store().backend(),
            "Cache engine running, press Ctrl-C to stop"
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;

        engine.shutdown();
        Ok(())
    })
}
