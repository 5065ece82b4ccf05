//! Common test utilities for audit-sync integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use audit_sync::clock::FixedClock;
use audit_sync::config::{DeliveryConfig, RetryConfig};
use audit_sync::delivery::{CollectionClient, DeliveryClient, HecSink};
use audit_sync::fetch::{CursorFetcher, CursorOutput, FetchOutput, RangeFetcher, SnapshotFetcher};
use audit_sync::{Database, Event, FetchWindow, Result, SourceRegistry, SyncContext, SyncEngine};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

/// Collector path used by every test environment
pub const HEC_PATH: &str = "/services/collector/event";

/// Collection API root used by every test environment
pub const COLLECTIONS_ROOT: &str = "/servicesNS/nobody/search";

/// Parse an RFC 3339 timestamp
pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .unwrap()
        .with_timezone(&Utc)
}

/// Build an event from a JSON literal
pub fn event(value: Value) -> Event {
    Event::from_value(value).unwrap()
}

/// Mock sink server, throwaway database and pinned clock
pub struct TestEnv {
    pub server: MockServer,
    pub db: Arc<Database>,
    pub clock: Arc<FixedClock>,
    pub db_path: PathBuf,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("audit-sync.db");
        let db = Arc::new(Database::new(&db_path).await.unwrap());
        Self {
            server: MockServer::start().await,
            db,
            clock: Arc::new(FixedClock::new(at("2024-01-10T12:00:00Z"))),
            db_path,
            _dir: dir,
        }
    }

    /// Delivery settings pointed at the mock server, with fast retries
    pub fn delivery_config(&self, max_attempts: u32) -> DeliveryConfig {
        DeliveryConfig {
            hec_url: format!("{}{}", self.server.uri(), HEC_PATH),
            collections_url: format!("{}{}", self.server.uri(), COLLECTIONS_ROOT),
            timeout: Duration::from_secs(5),
            accept_invalid_certs: false,
            retry: RetryConfig {
                max_attempts,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            retry_statuses: vec![500, 502, 503, 504],
        }
    }

    /// Context using the real HTTP sinks against the mock server
    pub fn context(&self, max_attempts: u32) -> SyncContext {
        let delivery = self.delivery_config(max_attempts);
        let client = DeliveryClient::new(&delivery).unwrap();

        SyncContext {
            config: Default::default(),
            store: self.db.clone(),
            events: Arc::new(HecSink::new(client.clone(), delivery.hec_url.clone())),
            collections: Arc::new(
                CollectionClient::new(client, &delivery.collections_url).unwrap(),
            ),
            clock: self.clock.clone(),
        }
    }

    pub fn engine(&self, registry: SourceRegistry) -> SyncEngine {
        SyncEngine::new(self.context(3), registry)
    }

    /// Every envelope the collector received, in arrival order
    pub async fn received_envelopes(&self) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == HEC_PATH)
            .flat_map(|r| {
                let body = String::from_utf8(r.body.clone()).unwrap();
                serde_json::Deserializer::from_str(&body)
                    .into_iter::<Value>()
                    .map(|v| v.unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Range fetcher serving scripted results and recording windows
#[derive(Default)]
pub struct ScriptedRange {
    responses: Mutex<Vec<FetchOutput>>,
    windows: Mutex<Vec<FetchWindow>>,
}

impl ScriptedRange {
    pub fn new(responses: Vec<FetchOutput>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            windows: Mutex::default(),
        })
    }

    pub fn windows(&self) -> Vec<FetchWindow> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeFetcher for ScriptedRange {
    async fn fetch_range(&self, window: &FetchWindow) -> Result<FetchOutput> {
        self.windows.lock().unwrap().push(*window);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Ok(FetchOutput::complete(Vec::new()));
        }
        Ok(responses.remove(0))
    }
}

/// Cursor fetcher over a fixed newest-first listing of numeric ids
pub struct ListingCursor {
    pub ids: Mutex<Vec<i64>>,
}

impl ListingCursor {
    pub fn new(ids: Vec<i64>) -> Arc<Self> {
        Arc::new(Self {
            ids: Mutex::new(ids),
        })
    }
}

#[async_trait]
impl CursorFetcher for ListingCursor {
    async fn fetch_since(&self, after_id: i64) -> Result<CursorOutput> {
        let listing: Vec<Event> = self
            .ids
            .lock()
            .unwrap()
            .iter()
            .map(|id| event(serde_json::json!({"id": id})))
            .collect();

        audit_sync::cursor::collect_since(
            after_id,
            |e| audit_sync::cursor::numeric_id(e, "id"),
            move |page| {
                let listing = listing.clone();
                async move {
                    // One page of two entries per request
                    let start = page as usize * 2;
                    let events: Vec<Event> = listing.iter().skip(start).take(2).cloned().collect();
                    let next = (start + 2 < listing.len()).then_some(page + 1);
                    Ok::<_, audit_sync::Error>(audit_sync::fetch::Page::Items { events, next })
                }
            },
        )
        .await
    }
}

/// Snapshot fetcher returning a fixed record set
pub struct StaticSnapshot(pub Vec<Event>);

#[async_trait]
impl SnapshotFetcher for StaticSnapshot {
    async fn fetch_all(&self) -> Result<FetchOutput> {
        Ok(FetchOutput::complete(self.0.clone()))
    }
}
