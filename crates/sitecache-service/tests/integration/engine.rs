use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use futures::future::join_all;
use sitecache_service::caching::{CacheError, CacheResult};
use sitecache_service::config::Backend;

use crate::{Counter, setup_engine};

const FRESH: Duration = Duration::from_secs(30);
const EXTENDED: Duration = Duration::from_secs(300);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_recreation_per_key_across_threads() {
    for backend in [Backend::Redb, Backend::Lmdb, Backend::Sqlite, Backend::Memory] {
        let (engine, _cache_dir) = setup_engine(|cfg| cfg.storage.backend = backend);
        let counters: BTreeMap<_, _> = ["en", "de", "fr", "in:bots"]
            .into_iter()
            .map(|key| (key, Counter::new()))
            .collect();

        let requests = (0..32).map(|i| {
            let (key, counter) = counters.iter().nth(i % counters.len()).unwrap();
            let (key, counter) = (key.to_string(), counter.clone());
            let engine = engine.clone();
            tokio::spawn(async move {
                let page = format!("page {key}");
                let recreate = move || async move {
                    counter.bump();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    CacheResult::Ok(Bytes::from(page))
                };
                engine
                    .get_cached_timeout(&key, FRESH, EXTENDED, recreate, false)
                    .await
            })
        });
        let results = join_all(requests).await;

        for result in results {
            assert!(result.unwrap().unwrap().starts_with(b"page "));
        }
        for (key, counter) in &counters {
            assert_eq!(counter.get(), 1, "{backend}: {key}");
        }
        assert!(engine.in_flight().is_empty());
    }
}

#[tokio::test]
async fn test_long_keys_on_every_backend() {
    let key = format!("topcat:site.com:/search?q={}", "lorem ipsum ".repeat(50));
    for backend in [Backend::Redb, Backend::Lmdb, Backend::Sqlite, Backend::Memory] {
        let (engine, _cache_dir) = setup_engine(|cfg| cfg.storage.backend = backend);
        let value = engine
            .get_cached_timeout(
                &key,
                FRESH,
                Duration::ZERO,
                || async { CacheResult::Ok(Bytes::from_static(b"page")) },
                false,
            )
            .await;
        assert_eq!(value, Ok(Bytes::from_static(b"page")), "{backend}");
        assert_eq!(
            engine.get_cached(&key),
            Ok(Some(Bytes::from_static(b"page"))),
            "{backend}"
        );
        assert_eq!(engine.clear_cache_by_prefix(&key).await, Ok(1), "{backend}");
        assert_eq!(engine.get_cached(&key), Ok(None), "{backend}");
    }
}

#[tokio::test]
async fn test_failure_turns_into_miss() {
    let (engine, _cache_dir) = setup_engine(|cfg| cfg.storage.backend = Backend::Lmdb);
    let past = Utc::now() - TimeDelta::seconds(1);
    engine
        .store()
        .write("topcat:site.com:en", b"outdated", past, past)
        .unwrap();

    let value = engine
        .get_cached_timeout(
            "topcat:site.com:en",
            FRESH,
            EXTENDED,
            || async { CacheResult::Err(CacheError::RecreationFailed("api timeout".into())) },
            false,
        )
        .await;
    assert_eq!(
        value,
        Err(CacheError::RecreationFailed("api timeout".into()))
    );
    assert_eq!(engine.store().read("topcat:site.com:en").unwrap(), None);
    assert_eq!(engine.get_cached("topcat:site.com:en"), Ok(None));
}

#[tokio::test]
async fn test_clear_many_keys_in_batches() {
    let (engine, _cache_dir) = setup_engine(|cfg| {
        cfg.storage.backend = Backend::Memory;
        // clamped up to the minimum batch size
        cfg.engine.prefix_delete_batch_size = 10;
    });

    for i in 0..2_500 {
        engine
            .put_cached(&format!("tr:site.com:{i:04}"), b"translation", FRESH)
            .unwrap();
    }
    engine
        .put_cached("tr:site.org:0000", b"translation", FRESH)
        .unwrap();

    assert_eq!(engine.clear_cache_by_prefix("tr:site.com:").await, Ok(2_500));
    assert_eq!(engine.get_cached("tr:site.com:1234"), Ok(None));
    assert_eq!(
        engine.get_cached("tr:site.org:0000"),
        Ok(Some(Bytes::from_static(b"translation")))
    );
}

#[tokio::test]
async fn test_background_sweeper() {
    let (engine, _cache_dir) = setup_engine(|cfg| {
        cfg.sweeper.enabled = true;
        cfg.sweeper.interval = Duration::from_millis(10);
        cfg.sweeper.jitter = Duration::ZERO;
    });
    let past = Utc::now() - TimeDelta::seconds(1);
    engine.store().write("expired", b"page", past, past).unwrap();
    engine.put_cached("alive", b"page", FRESH).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.store().read("expired").unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(engine.get_cached("alive").unwrap().is_some());
}

#[tokio::test]
async fn test_shutdown_fails_waiters() {
    let (engine, _cache_dir) = setup_engine(|_| ());
    engine.shutdown();

    let value = engine
        .get_cached_timeout(
            "topcat:site.com:en",
            FRESH,
            EXTENDED,
            || async { CacheResult::Ok(Bytes::from_static(b"never stored")) },
            false,
        )
        .await;
    assert_eq!(value, Err(CacheError::Shutdown));
    assert_eq!(engine.get_cached("topcat:site.com:en"), Ok(None));

    // fixed TTL entries do not need the queues
    engine.put_cached("topcat:site.com:en", b"manual", FRESH).unwrap();
    assert_eq!(
        engine.get_cached("topcat:site.com:en"),
        Ok(Some(Bytes::from_static(b"manual")))
    );
}
