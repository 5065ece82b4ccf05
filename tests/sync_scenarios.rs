//! End-to-end sync scenarios against a mock collector
//!
//! Each test runs the engine with the real SQLite store and the real HTTP
//! sinks pointed at a wiremock server, with a pinned clock.

mod common;

use audit_sync::checkpoint::CommittedCheckpoint;
use audit_sync::config::{Continuation, EmptyWindow, PartialPagePolicy};
use audit_sync::engine::RunState;
use audit_sync::error::DeliveryError;
use audit_sync::fetch::FetchOutput;
use audit_sync::store::CheckpointStore;
use audit_sync::types::IdSpec;
use audit_sync::{
    Database, Error, Fetcher, RunRequest, SourceConfig, SourceId, SourceRegistry, StoreKey,
    SyncEngine, TimeUnit,
};
use chrono::Duration;
use common::*;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

const RESUME: RunRequest = RunRequest::Resume {
    unit: TimeUnit::Minutes,
};

fn source(id: &str) -> SourceConfig {
    let mut config = SourceConfig::new(id, StoreKey::new(id).unwrap());
    config.hec_token = format!("{id}-token");
    config
}

fn range(config: SourceConfig, fetcher: Arc<ScriptedRange>) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    registry.register(config, Fetcher::Range(fetcher)).unwrap();
    registry
}

async fn accept_everything(env: &TestEnv) {
    Mock::given(method("POST"))
        .and(path(HEC_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&env.server)
        .await;
}

#[tokio::test]
async fn test_first_run_delivers_envelopes_with_source_token() {
    let env = TestEnv::start().await;
    Mock::given(method("POST"))
        .and(path(HEC_PATH))
        .and(header("Authorization", "Splunk jira-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.server)
        .await;

    let fetcher = ScriptedRange::new(vec![FetchOutput::complete(vec![
        event(json!({"id": 1, "created": "2024-01-10T11:58:00Z", "kind": "jira:audit"})),
        event(json!({"id": 2, "created": "2024-01-10T11:59:00Z", "kind": "jira:audit"})),
    ])]);
    let mut config = source("jira");
    config.time_field = Some("created".into());
    config.category_field = Some("kind".into());
    let engine = env.engine(range(config, fetcher));

    let report = engine.run(&SourceId::new("jira"), RESUME).await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(report.state, RunState::Checkpointed);

    let envelopes = env.received_envelopes().await;
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0]["sourcetype"], json!("jira:audit"));
    assert_eq!(envelopes[0]["event"], json!({"id": 1, "created": "2024-01-10T11:58:00Z"}));
    assert_eq!(envelopes[0]["time"].as_f64(), Some(1_704_887_880.0));
}

#[tokio::test]
async fn test_steady_state_runs_cover_time_without_gaps() {
    let env = TestEnv::start().await;
    accept_everything(&env).await;
    let fetcher = ScriptedRange::new(Vec::new());
    let engine = env.engine(range(source("confluence"), fetcher.clone()));
    let id = SourceId::new("confluence");

    for _ in 0..4 {
        engine.run(&id, RESUME).await.unwrap();
        env.clock.advance(Duration::minutes(5));
    }

    let windows = fetcher.windows();
    assert_eq!(windows.len(), 4);
    for pair in windows.windows(2) {
        assert_eq!(pair[1].start, pair[0].end);
    }
    let history = env
        .db
        .range_history(&StoreKey::new("confluence").unwrap())
        .await
        .unwrap();
    assert_eq!(history.len(), 4);
}

#[tokio::test]
async fn test_transient_collector_error_is_retried() {
    let env = TestEnv::start().await;
    Mock::given(method("POST"))
        .and(path(HEC_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&env.server)
        .await;
    Mock::given(method("POST"))
        .and(path(HEC_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.server)
        .await;

    let fetcher = ScriptedRange::new(vec![FetchOutput::complete(vec![event(json!({"id": 1}))])]);
    let engine = env.engine(range(source("jira"), fetcher));

    let report = engine.run(&SourceId::new("jira"), RESUME).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(report.checkpoint.is_some());
}

#[tokio::test]
async fn test_rejected_batch_fails_run_and_rerun_repeats_window() {
    let env = TestEnv::start().await;
    Mock::given(method("POST"))
        .and(path(HEC_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid token"))
        .expect(1)
        .mount(&env.server)
        .await;

    let batch = vec![event(json!({"id": 1})), event(json!({"id": 2}))];
    let fetcher = ScriptedRange::new(vec![
        FetchOutput::complete(batch.clone()),
        FetchOutput::complete(batch),
    ]);
    let mut config = source("jira");
    config.dedup_id = Some(IdSpec::Field("id".into()));
    let engine = env.engine(range(config, fetcher.clone()));
    let id = SourceId::new("jira");
    let key = StoreKey::new("jira").unwrap();

    match engine.run(&id, RESUME).await {
        Err(Error::Delivery(DeliveryError::Status { status, body, .. })) => {
            assert_eq!(status, 400);
            assert_eq!(body, "invalid token");
        }
        other => panic!("expected a delivery error, got {other:?}"),
    }
    assert!(env.db.latest_range(&key).await.unwrap().is_none());
    env.server.verify().await;

    env.server.reset().await;
    accept_everything(&env).await;

    let report = engine.run(&id, RESUME).await.unwrap();
    let windows = fetcher.windows();
    assert_eq!(windows[0], windows[1]);
    assert_eq!(report.new_events, 2, "nothing was marked seen by the failed run");
}

#[tokio::test]
async fn test_schedule_ahead_of_clock_is_refused() {
    let env = TestEnv::start().await;
    accept_everything(&env).await;
    let fetcher = ScriptedRange::new(Vec::new());
    let engine = env.engine(range(source("zoom"), fetcher.clone()));
    let id = SourceId::new("zoom");

    // Daily continuation started five minutes ago ends a day in the future
    engine
        .run(&id, RunRequest::Resume { unit: TimeUnit::Days })
        .await
        .unwrap();
    engine
        .run(&id, RunRequest::Resume { unit: TimeUnit::Days })
        .await
        .unwrap();
    let result = engine
        .run(&id, RunRequest::Resume { unit: TimeUnit::Days })
        .await;

    assert!(matches!(result, Err(Error::FutureWindow { .. })));
    assert_eq!(fetcher.windows().len(), 2);
}

#[tokio::test]
async fn test_windowed_source_waits_for_events_then_advances() {
    let env = TestEnv::start().await;
    accept_everything(&env).await;
    let fetcher = ScriptedRange::new(vec![
        FetchOutput::complete(Vec::new()),
        FetchOutput::complete(vec![event(
            json!({"id": "x", "time": "2024-01-10T11:59:00Z"}),
        )]),
    ]);
    let mut config = source("workspace_login");
    config.continuation = Continuation::Windowed;
    config.empty_window = EmptyWindow::Hold;
    config.time_field = Some("time".into());
    let engine = env.engine(range(config, fetcher.clone()));
    let id = SourceId::new("workspace_login");

    let first = engine.run(&id, RESUME).await.unwrap();
    env.clock.advance(Duration::minutes(2));
    let second = engine.run(&id, RESUME).await.unwrap();

    match (first.checkpoint, second.checkpoint) {
        (Some(CommittedCheckpoint::Range(empty)), Some(CommittedCheckpoint::Range(advanced))) => {
            assert!(!empty.success);
            assert!(advanced.success);
            assert_eq!(advanced.start, at("2024-01-10T11:59:00.001Z"));
            assert_eq!(advanced.end, at("2024-01-10T12:02:00Z"));
        }
        other => panic!("unexpected checkpoints {other:?}"),
    }
    let windows = fetcher.windows();
    assert_eq!(windows[0], windows[1]);
}

#[tokio::test]
async fn test_delivered_ids_survive_a_restart() {
    let env = TestEnv::start().await;
    accept_everything(&env).await;
    let mut config = source("zoom");
    config.dedup_id = Some(IdSpec::Composite {
        fields: vec!["id".into(), "action".into()],
        separator: ":".into(),
    });

    let first = ScriptedRange::new(vec![FetchOutput::complete(vec![
        event(json!({"id": 1, "action": "login"})),
        event(json!({"id": 1, "action": "logout"})),
    ])]);
    env.engine(range(config.clone(), first))
        .run(&SourceId::new("zoom"), RESUME)
        .await
        .unwrap();

    // A fresh process: new database handle and engine over the same file
    let reopened = Arc::new(Database::new(&env.db_path).await.unwrap());
    let mut context = env.context(3);
    context.store = reopened;
    let second = ScriptedRange::new(vec![FetchOutput::complete(vec![
        event(json!({"id": 1, "action": "logout"})),
        event(json!({"id": 2, "action": "login"})),
    ])]);
    env.clock.advance(Duration::minutes(5));
    let report = SyncEngine::new(context, range(config, second))
        .run(&SourceId::new("zoom"), RESUME)
        .await
        .unwrap();

    assert_eq!(report.fetched, 2);
    assert_eq!(report.new_events, 1);
    let envelopes = env.received_envelopes().await;
    assert_eq!(envelopes.len(), 3);
    assert_eq!(envelopes[2]["event"], json!({"id": 2, "action": "login"}));
}

#[tokio::test]
async fn test_cursor_source_pages_until_known_id() {
    let env = TestEnv::start().await;
    accept_everything(&env).await;
    let listing = ListingCursor::new(vec![105, 104, 103, 102, 101]);
    let mut config = source("fleetdm");
    config.initial_cursor = 102;
    let mut registry = SourceRegistry::new();
    registry
        .register(config, Fetcher::Cursor(listing.clone()))
        .unwrap();
    let engine = env.engine(registry);
    let id = SourceId::new("fleetdm");

    let report = engine.run(&id, RESUME).await.unwrap();
    assert_eq!(report.delivered, 3);
    let ids: Vec<_> = env
        .received_envelopes()
        .await
        .iter()
        .map(|e| e["event"]["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!(103), json!(104), json!(105)]);

    // Nothing new: cursor stays put
    let report = engine.run(&id, RESUME).await.unwrap();
    assert_eq!(report.delivered, 0);
    let latest = env
        .db
        .latest_cursor(&StoreKey::new("fleetdm").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.last_id, 105);
    assert_eq!(latest.fetched_count, 0);
}

#[tokio::test]
async fn test_snapshot_source_replaces_collection_in_batches() {
    let env = TestEnv::start().await;
    let collection_path = format!("{}/storage/collections/data/kv_hr_info", COLLECTIONS_ROOT);
    Mock::given(method("DELETE"))
        .and(path(collection_path.as_str()))
        .and(header("Authorization", "Bearer kv-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch_save", collection_path).as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&env.server)
        .await;

    let records: Vec<_> = (0..5)
        .map(|i| event(json!({"_key": format!("emp{i}"), "dept": "eng"})))
        .collect();
    let mut config = source("hr_directory");
    config.collection = Some("kv_hr_info".into());
    config.collection_token = Some("kv-token".into());
    config.batch_size = 2;
    let mut registry = SourceRegistry::new();
    registry
        .register(config, Fetcher::Snapshot(Arc::new(StaticSnapshot(records))))
        .unwrap();

    let report = env
        .engine(registry)
        .run(&SourceId::new("hr_directory"), RunRequest::Snapshot)
        .await
        .unwrap();

    assert_eq!(report.delivered, 5);
    assert_eq!(report.batches, 3);
    env.server.verify().await;
}

#[tokio::test]
async fn test_partial_fetch_policy_is_per_source() {
    let env = TestEnv::start().await;
    accept_everything(&env).await;
    let truncated = || FetchOutput::partial(vec![event(json!({"id": 1}))]);

    let mut strict = source("strict");
    strict.partial_pages = PartialPagePolicy::Fail;
    let mut registry = SourceRegistry::new();
    registry
        .register(strict, Fetcher::Range(ScriptedRange::new(vec![truncated()])))
        .unwrap();
    registry
        .register(
            source("lenient"),
            Fetcher::Range(ScriptedRange::new(vec![truncated()])),
        )
        .unwrap();
    let engine = env.engine(registry);

    assert!(matches!(
        engine.run(&SourceId::new("strict"), RESUME).await,
        Err(Error::Fetch(_))
    ));
    let report = engine.run(&SourceId::new("lenient"), RESUME).await.unwrap();
    assert!(report.partial);
    assert_eq!(report.delivered, 1);
    assert_eq!(env.received_envelopes().await.len(), 1);
}

#[tokio::test]
async fn test_purge_forgets_checkpoints_and_delivered_ids() {
    let env = TestEnv::start().await;
    accept_everything(&env).await;
    let batch = || FetchOutput::complete(vec![event(json!({"id": 7}))]);
    let mut config = source("jira");
    config.dedup_id = Some(IdSpec::Field("id".into()));
    let engine = env.engine(range(config, ScriptedRange::new(vec![batch(), batch()])));
    let id = SourceId::new("jira");
    let key = StoreKey::new("jira").unwrap();

    engine.run(&id, RESUME).await.unwrap();
    engine.purge(&id).await.unwrap();
    assert!(env.db.latest_range(&key).await.unwrap().is_none());

    let report = engine.run(&id, RESUME).await.unwrap();
    assert_eq!(report.new_events, 1);
    assert_eq!(env.received_envelopes().await.len(), 2);
}

#[tokio::test]
#[serial]
async fn test_scheduler_runs_sources_until_shutdown() {
    let env = TestEnv::start().await;
    accept_everything(&env).await;
    let listing = ListingCursor::new(vec![3, 2, 1]);
    let mut config = source("fleetdm");
    config.interval = Some(std::time::Duration::from_millis(25));
    let mut registry = SourceRegistry::new();
    registry
        .register(config, Fetcher::Cursor(listing.clone()))
        .unwrap();
    let engine = Arc::new(env.engine(registry));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let scheduler = audit_sync::Scheduler::new(engine, TimeUnit::Minutes);
    let handle = tokio::spawn(scheduler.run(rx));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    listing.ids.lock().unwrap().insert(0, 4);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let ids: Vec<_> = env
        .received_envelopes()
        .await
        .iter()
        .map(|e| e["event"]["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4)]);
    let latest = env
        .db
        .latest_cursor(&StoreKey::new("fleetdm").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.last_id, 4);
}
