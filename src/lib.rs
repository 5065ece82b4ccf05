//! # audit-sync
//!
//! Incremental synchronization engine for polling third-party audit-log APIs
//! and forwarding their events to a log-ingestion sink.
//!
//! ## Guarantees
//!
//! - **At-least-once** - a run's checkpoint is only appended after every batch
//!   was accepted, so a failed run is simply repeated
//! - **Restart safe** - progress lives in an append-only SQLite log per source
//! - **Deduplicated** - sources with an id spec never deliver the same event twice
//!   once it has been recorded
//! - **Library-first** - vendor adapters and the CLI live in the embedding binary
//!
//! ## Quick Start
//!
//! ```no_run
//! use audit_sync::{Config, RunRequest, SourceRegistry, SyncContext, SyncEngine};
//! use audit_sync::types::{SourceId, TimeUnit};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_json(r#"{
//!         "delivery": {"hec_url": "https://splunk.example.com:8088/services/collector/event"},
//!         "sources": [{"id": "jira", "store_key": "jira", "hec_token": "..."}]
//!     }"#)?;
//!
//!     let registry = SourceRegistry::new();
//!     // registry.register_configured(&config, "jira", Fetcher::Range(..), EnrichmentChain::new())?;
//!
//!     let engine = SyncEngine::new(SyncContext::connect(config).await?, registry);
//!     let report = engine
//!         .run(&SourceId::new("jira"), RunRequest::Resume { unit: TimeUnit::Minutes })
//!         .await?;
//!     println!("{:?}", report);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Replaying exported event files
pub mod backfill;
/// Fixed-size batching
pub mod batch;
/// Checkpoint writer
pub mod checkpoint;
/// Wall-clock abstraction
pub mod clock;
/// Configuration types
pub mod config;
/// Cursor-based fetching
pub mod cursor;
/// Database persistence layer
pub mod db;
/// Delivered-event suppression
pub mod dedup;
/// Sink delivery (event collector and collections)
pub mod delivery;
/// Run orchestration
pub mod engine;
/// Event enrichment steps
pub mod enrich;
/// Error types
pub mod error;
/// Source fetcher contracts
pub mod fetch;
/// Source registry
pub mod registry;
/// Retry logic with exponential backoff
pub mod retry;
/// Periodic source runs
pub mod scheduler;
/// Checkpoint and dedup store contracts
pub mod store;
/// Core types
pub mod types;
/// Fetch window calculation
pub mod window;

// Re-export commonly used types
pub use backfill::{FileIngest, IngestReport, ingest_file};
pub use config::{Config, SourceConfig};
pub use db::Database;
pub use engine::{RunReport, RunRequest, SyncContext, SyncEngine};
pub use error::{DatabaseError, DeliveryError, Error, FetchError, Result};
pub use registry::{Fetcher, SourceRegistry};
pub use scheduler::Scheduler;
pub use types::{Event, FetchWindow, SourceId, StoreKey, TimeUnit};

/// Run `engine`'s scheduled sources until a termination signal arrives.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use audit_sync::{Config, SourceRegistry, SyncContext, SyncEngine, TimeUnit, run_with_shutdown};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::load(std::path::Path::new("sync.json")).await?;
///     let engine = SyncEngine::new(SyncContext::connect(config).await?, SourceRegistry::new());
///
///     // Runs every source with an interval until SIGTERM/SIGINT
///     run_with_shutdown(Arc::new(engine), TimeUnit::Minutes).await;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: std::sync::Arc<SyncEngine>, unit: TimeUnit) {
    Scheduler::new(engine, unit).run_until_signal().await
}

/// Resolves on the first SIGTERM or SIGINT
///
/// A signal whose handler cannot be installed (restricted containers, some
/// test harnesses) is skipped; with neither installed, falls back to
/// `tokio::signal::ctrl_c`.
#[cfg(unix)]
pub(crate) async fn wait_for_signal() {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    fn install(kind: SignalKind, name: &'static str) -> Option<(Signal, &'static str)> {
        match signal(kind) {
            Ok(stream) => Some((stream, name)),
            Err(e) => {
                tracing::warn!(error = %e, signal = name, "Signal handler unavailable");
                None
            }
        }
    }

    async fn next(handler: &mut Option<(Signal, &'static str)>) -> &'static str {
        match handler {
            Some((stream, name)) => {
                stream.recv().await;
                name
            }
            None => std::future::pending().await,
        }
    }

    let mut term = install(SignalKind::terminate(), "SIGTERM");
    let mut int = install(SignalKind::interrupt(), "SIGINT");

    if term.is_none() && int.is_none() {
        tracing::error!("No signal handlers installed, waiting on ctrl_c");
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c listener failed");
        }
        return;
    }

    let received = tokio::select! {
        name = next(&mut term) => name,
        name = next(&mut int) => name,
    };
    tracing::info!(signal = received, "Shutdown signal received");
}

/// Resolves on Ctrl+C
#[cfg(not(unix))]
pub(crate) async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!(signal = "ctrl_c", "Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "ctrl_c listener failed"),
    }
}
