//! Sync engine
//!
//! Drives one run of a source through its stages:
//!
//! ```text
//! WindowComputed -> Fetched -> Deduped -> Delivering{i,n} -> Delivered -> Checkpointed
//! ```
//!
//! Any error before `Checkpointed` is terminal for the run and leaves the store
//! untouched, so the next run re-derives the same (or an overlapping) target.
//! Delivery is at-least-once.
//!
//! # Example
//!
//! ```no_run
//! use audit_sync::config::Config;
//! use audit_sync::engine::{RunRequest, SyncContext, SyncEngine};
//! use audit_sync::registry::SourceRegistry;
//! use audit_sync::types::{SourceId, TimeUnit};
//!
//! # async fn example() -> audit_sync::Result<()> {
//! let config = Config::load(std::path::Path::new("sync.json")).await?;
//! let registry = SourceRegistry::new(); // register vendor adapters here
//! let context = SyncContext::connect(config).await?;
//! let engine = SyncEngine::new(context, registry);
//!
//! let report = engine
//!     .run(&SourceId::new("jira"), RunRequest::Resume { unit: TimeUnit::Minutes })
//!     .await?;
//! println!("delivered {} events", report.delivered);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::backfill::{self, FileIngest, IngestReport};
use crate::checkpoint::{CheckpointWriter, CommittedCheckpoint};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Database;
use crate::dedup::Deduplicator;
use crate::delivery::{CollectionClient, CollectionSink, DeliveryClient, EventSink, HecSink};
use crate::error::{Error, Result};
use crate::registry::SourceRegistry;
use crate::store::SyncStore;
use crate::types::{Event, FetchWindow, SourceId, TimeUnit};
use crate::window::WindowCalculator;

mod run;

/// Long-lived collaborators shared by every run
///
/// Built once at process start and passed to [`SyncEngine::new`].
pub struct SyncContext {
    /// Process configuration
    pub config: Config,
    /// Checkpoint and dedup store
    pub store: Arc<dyn SyncStore>,
    /// Event collector sink
    pub events: Arc<dyn EventSink>,
    /// Collection sink for snapshot sources
    pub collections: Arc<dyn CollectionSink>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl SyncContext {
    /// Open the SQLite store and build the HTTP sinks described by `config`
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(Database::new(&config.store.database_path).await?);
        let client = DeliveryClient::new(&config.delivery)?;
        let events = Arc::new(HecSink::new(client.clone(), config.delivery.hec_url.clone()));
        let collections = Arc::new(CollectionClient::new(
            client,
            &config.delivery.collections_url,
        )?);

        tracing::info!(
            database = %config.store.database_path.display(),
            hec_url = %config.delivery.hec_url,
            sources = config.sources.len(),
            "Sync context ready"
        );

        Ok(Self {
            config,
            store,
            events,
            collections,
            clock: Arc::new(SystemClock),
        })
    }
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// What a run should do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunRequest {
    /// Fetch `[now - n * unit, now)` without reading or writing checkpoints
    Lookback {
        /// Number of units
        n: u32,
        /// Lookback unit
        unit: TimeUnit,
    },
    /// Fetch everything after `after_id` without reading or writing checkpoints
    FromCursor {
        /// Exclusive lower bound
        after_id: i64,
    },
    /// Continue from the persisted checkpoint
    Resume {
        /// Unit of a simple continuation
        unit: TimeUnit,
    },
    /// Replace a snapshot source's collection
    Snapshot,
}

/// Stage a run has reached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// Nothing done yet
    Started,
    /// Fetch target decided
    WindowComputed,
    /// Vendor fetch finished
    Fetched,
    /// Already-delivered events removed
    Deduped,
    /// Sending batch `batch` of `batches`
    Delivering {
        /// 1-based batch number
        batch: usize,
        /// Total batches
        batches: usize,
    },
    /// Every batch accepted by the sink
    Delivered,
    /// Checkpoint appended
    Checkpointed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Started => f.write_str("started"),
            RunState::WindowComputed => f.write_str("window_computed"),
            RunState::Fetched => f.write_str("fetched"),
            RunState::Deduped => f.write_str("deduped"),
            RunState::Delivering { batch, batches } => {
                write!(f, "delivering({}/{})", batch, batches)
            }
            RunState::Delivered => f.write_str("delivered"),
            RunState::Checkpointed => f.write_str("checkpointed"),
        }
    }
}

/// What a run fetched from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTarget {
    /// A time window
    Window {
        /// The fetched window
        window: FetchWindow,
        /// Whether the window came from (and advances) the checkpoint
        persisted: bool,
    },
    /// Everything after a cursor
    Cursor {
        /// Exclusive lower bound
        after_id: i64,
        /// Whether the cursor came from (and advances) the checkpoint
        persisted: bool,
    },
    /// A full snapshot
    Snapshot {
        /// Collection being replaced
        collection: String,
    },
}

impl fmt::Display for RunTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTarget::Window { window, .. } => write!(f, "window {}", window),
            RunTarget::Cursor { after_id, .. } => write!(f, "after id {}", after_id),
            RunTarget::Snapshot { collection } => write!(f, "snapshot of {}", collection),
        }
    }
}

/// Summary of a finished run
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
    /// Source that ran
    pub source: SourceId,
    /// What was fetched
    pub target: RunTarget,
    /// Events returned by the vendor
    pub fetched: usize,
    /// Events left after dedup
    pub new_events: usize,
    /// Events accepted by the sink
    pub delivered: usize,
    /// Requests sent to the sink
    pub batches: usize,
    /// Whether pagination stopped early
    pub partial: bool,
    /// Checkpoint appended, if the run was persisted
    pub checkpoint: Option<CommittedCheckpoint>,
    /// Final stage reached
    pub state: RunState,
}

/// Result of a fetch-only preview
#[derive(Clone, Debug, PartialEq)]
pub struct Preview {
    /// What was fetched
    pub target: RunTarget,
    /// Enriched events that a run would deliver
    pub events: Vec<Event>,
    /// Events returned by the vendor, before dedup
    pub fetched: usize,
    /// Whether pagination stopped early
    pub partial: bool,
}

/// Runs registered sources against a [`SyncContext`]
pub struct SyncEngine {
    context: SyncContext,
    registry: SourceRegistry,
    locks: HashMap<SourceId, tokio::sync::Mutex<()>>,
    calculator: WindowCalculator,
    dedup: Deduplicator,
    writer: CheckpointWriter,
}

impl SyncEngine {
    /// Create an engine for the sources in `registry`
    pub fn new(context: SyncContext, registry: SourceRegistry) -> Self {
        let locks = registry
            .ids()
            .into_iter()
            .map(|id| (id, tokio::sync::Mutex::new(())))
            .collect();

        let calculator = WindowCalculator::new(context.clock.clone(), context.store.clone());
        let dedup = Deduplicator::new(context.store.clone());
        let writer = CheckpointWriter::new(context.store.clone(), context.clock.clone());

        Self {
            context,
            registry,
            locks,
            calculator,
            dedup,
            writer,
        }
    }

    /// The shared context
    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    /// The registered sources
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Claim the run slot of `id`, failing if another run holds it
    fn claim(&self, id: &SourceId) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        let lock = self
            .locks
            .get(id)
            .ok_or_else(|| Error::UnknownSource(id.to_string()))?;
        lock.try_lock()
            .map_err(|_| Error::RunInProgress(id.to_string()))
    }

    /// Drop every checkpoint and dedup record of a source
    ///
    /// Refused while a run of the source is active.
    pub async fn purge(&self, id: &SourceId) -> Result<()> {
        let source = self.registry.get(id)?;
        let _guard = self.claim(id)?;

        self.context.store.purge(&source.config.store_key).await?;
        tracing::warn!(source = %id, store_key = %source.config.store_key, "Source state purged");
        Ok(())
    }

    /// Replay an export file of `id`'s events through the event sink
    ///
    /// Uses the source's token, time field, category field and batch size.
    /// Checkpoints and dedup records are left alone, so this may run next to
    /// scheduled runs.
    pub async fn ingest_file(
        &self,
        id: &SourceId,
        path: &Path,
        time_format: Option<String>,
    ) -> Result<IngestReport> {
        let source = self.registry.get(id)?;
        let options = FileIngest::for_source(&source.config, time_format)?;
        backfill::ingest_file(self.context.events.as_ref(), path, &options).await
    }
}
