use std::sync::Arc;
use std::time::Duration;

use sitecache_service::caching::CacheEngine;
use sitecache_service::config::Config;
use sitecache_test as test;

pub use test::{Counter, TempDir};

/// Setup tests and create an engine on top of a temporary cache directory.
///
/// The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as guard until
/// the test has finished.
///
/// The sweeper is disabled, tests run it explicitly when they need it. The `update_config`
/// closure can modify any default configuration before the engine is started.
pub fn setup_engine(update_config: impl FnOnce(&mut Config)) -> (CacheEngine, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();

    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    config.sweeper.enabled = false;
    config.storage.lmdb_map_size = 64 * 1024 * 1024;
    update_config(&mut config);

    let engine = start_engine(&config);
    (engine, cache_dir)
}

/// Starts an engine for an existing configuration, for example to reopen a cache directory.
pub fn start_engine(config: &Config) -> CacheEngine {
    let handle = tokio::runtime::Handle::current();
    CacheEngine::start(config, &handle).unwrap()
}

/// Shuts the engine down and waits until its workers released the store.
///
/// The on-disk engines can only be opened once per process, so this is needed before the same
/// cache directory is opened again.
pub async fn close_engine(engine: CacheEngine) {
    engine.shutdown();
    let store = Arc::clone(engine.store());
    drop(engine);

    tokio::time::timeout(Duration::from_secs(5), async {
        while Arc::strong_count(&store) > 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}
