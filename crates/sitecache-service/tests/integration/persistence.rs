use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sitecache_service::caching::CacheResult;
use sitecache_service::config::Backend;
use sitecache_service::storage::Layout;

use crate::{Counter, close_engine, setup_engine, start_engine};

const FRESH: Duration = Duration::from_secs(30);
const EXTENDED: Duration = Duration::from_secs(300);

fn render(counter: Counter) -> impl FnOnce() -> futures::future::Ready<CacheResult> {
    move || {
        counter.bump();
        futures::future::ready(Ok(Bytes::from_static(b"<h1>persisted</h1>")))
    }
}

#[tokio::test]
async fn test_entries_survive_restart() {
    for (backend, layout) in [
        (Backend::Redb, Layout::TwinBucket),
        (Backend::Redb, Layout::InvertedIndex),
        (Backend::Lmdb, Layout::InvertedIndex),
        (Backend::Lmdb, Layout::TwinBucket),
        (Backend::Sqlite, Layout::InvertedIndex),
        (Backend::Sqlite, Layout::TwinBucket),
    ] {
        let mut config = None;
        let (engine, _cache_dir) = setup_engine(|cfg| {
            cfg.storage.backend = backend;
            cfg.storage.layout = Some(layout);
            config = Some(cfg.clone());
        });
        let config = config.unwrap();
        let counter = Counter::new();

        let value = engine
            .get_cached_timeout(
                "topcat:site.com:en",
                FRESH,
                EXTENDED,
                render(counter.clone()),
                false,
            )
            .await;
        assert_eq!(value, Ok(Bytes::from_static(b"<h1>persisted</h1>")));
        close_engine(engine).await;

        let engine = start_engine(&config);
        assert_eq!(engine.store().backend(), backend.name());
        assert_eq!(engine.store().layout(), layout);

        let value = engine
            .get_cached_timeout(
                "topcat:site.com:en",
                FRESH,
                EXTENDED,
                render(counter.clone()),
                false,
            )
            .await;
        assert_eq!(value, Ok(Bytes::from_static(b"<h1>persisted</h1>")));
        assert_eq!(counter.get(), 1, "{backend}");
        close_engine(engine).await;
    }
}

#[tokio::test]
async fn test_snapshot_marker_survives_restart() {
    let mut config = None;
    let (engine, _cache_dir) = setup_engine(|cfg| config = Some(cfg.clone()));
    let config = config.unwrap();

    let taken_at: DateTime<Utc> = "2026-10-18T04:00:00.125Z".parse().unwrap();
    engine.store().record_snapshot(taken_at).unwrap();
    close_engine(engine).await;

    let engine = start_engine(&config);
    assert_eq!(engine.store().last_snapshot().unwrap(), Some(taken_at));
}
