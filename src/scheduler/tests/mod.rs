use super::*;
use crate::clock::SystemClock;
use crate::config::{Config, SourceConfig};
use crate::db::Database;
use crate::delivery::tests::{RecordingSink, fast_config};
use crate::delivery::{CollectionClient, DeliveryClient};
use crate::engine::SyncContext;
use crate::error::{FetchError, Result};
use crate::fetch::{CursorFetcher, CursorOutput};
use crate::registry::{Fetcher, SourceRegistry};
use crate::types::StoreKey;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::NamedTempFile;

/// Cursor fetcher that counts calls and never finds anything new
#[derive(Default)]
struct CountingCursor {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl CursorFetcher for CountingCursor {
    async fn fetch_since(&self, after_id: i64) -> Result<CursorOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FetchError::Vendor("vendor unavailable".into()).into());
        }
        Ok(CursorOutput {
            max_id: after_id,
            ..Default::default()
        })
    }
}

fn source(id: &str, interval: Option<Duration>) -> SourceConfig {
    let mut config = SourceConfig::new(id, StoreKey::new(id).unwrap());
    config.interval = interval;
    config
}

async fn engine(registry: SourceRegistry) -> (NamedTempFile, Arc<SyncEngine>) {
    let file = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(file.path()).await.unwrap());
    let delivery = fast_config("http://127.0.0.1:9");
    let collections =
        CollectionClient::new(DeliveryClient::new(&delivery).unwrap(), &delivery.collections_url)
            .unwrap();

    let context = SyncContext {
        config: Config::default(),
        store: db,
        events: Arc::new(RecordingSink::default()),
        collections: Arc::new(collections),
        clock: Arc::new(SystemClock),
    };
    (file, Arc::new(SyncEngine::new(context, registry)))
}

#[tokio::test]
async fn test_only_sources_with_interval_are_scheduled() {
    let mut registry = SourceRegistry::new();
    for (id, interval) in [
        ("fleetdm", Some(Duration::from_secs(60))),
        ("manual", None),
        ("disabled", Some(Duration::ZERO)),
    ] {
        registry
            .register(
                source(id, interval),
                Fetcher::Cursor(Arc::new(CountingCursor::default())),
            )
            .unwrap();
    }
    let (_file, engine) = engine(registry).await;

    let scheduler = Scheduler::new(engine, TimeUnit::Minutes);
    assert_eq!(
        scheduler.scheduled(),
        vec![(SourceId::new("fleetdm"), Duration::from_secs(60))]
    );
}

#[tokio::test]
async fn test_sources_run_repeatedly_until_shutdown() {
    let fetcher = Arc::new(CountingCursor::default());
    let mut registry = SourceRegistry::new();
    registry
        .register(
            source("fleetdm", Some(Duration::from_millis(20))),
            Fetcher::Cursor(fetcher.clone()),
        )
        .unwrap();
    let (_file, engine) = engine(registry).await;

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Scheduler::new(engine, TimeUnit::Minutes).run(rx));

    tokio::time::sleep(Duration::from_millis(150)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    let calls = fetcher.calls.load(Ordering::SeqCst);
    assert!(calls >= 2, "expected repeated runs, got {calls}");

    // No runs after shutdown
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_failed_runs_are_retried_on_next_tick() {
    let fetcher = Arc::new(CountingCursor {
        fail: true,
        ..Default::default()
    });
    let mut registry = SourceRegistry::new();
    registry
        .register(
            source("fleetdm", Some(Duration::from_millis(20))),
            Fetcher::Cursor(fetcher.clone()),
        )
        .unwrap();
    let (_file, engine) = engine(registry).await;

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Scheduler::new(engine, TimeUnit::Minutes).run(rx));

    tokio::time::sleep(Duration::from_millis(150)).await;
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop after sender was dropped")
        .unwrap();

    assert!(fetcher.calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_scheduler_without_sources_returns_immediately() {
    let (_file, engine) = engine(SourceRegistry::new()).await;
    let (_tx, rx) = watch::channel(false);

    tokio::time::timeout(
        Duration::from_secs(1),
        Scheduler::new(engine, TimeUnit::Minutes).run(rx),
    )
    .await
    .expect("idle scheduler should return");
}
