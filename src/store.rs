//! Checkpoint and dedup store contracts
//!
//! The engine only talks to persistence through these traits. [`Database`]
//! (SQLite) is the production implementation.
//!
//! Every log is append-only: "latest" means the most recently appended row,
//! and `None` ("never ran") is distinct from a row recording zero events.
//!
//! [`Database`]: crate::db::Database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::error::Result;
use crate::types::{CursorCheckpoint, RangeCheckpoint, StoreKey};

/// Per-source checkpoint logs
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Most recently appended range (or windowed) checkpoint
    async fn latest_range(&self, key: &StoreKey) -> Result<Option<RangeCheckpoint>>;

    /// Append a range (or windowed) checkpoint
    async fn append_range(&self, key: &StoreKey, checkpoint: &RangeCheckpoint) -> Result<()>;

    /// Most recently appended cursor checkpoint
    async fn latest_cursor(&self, key: &StoreKey) -> Result<Option<CursorCheckpoint>>;

    /// Append a cursor checkpoint
    async fn append_cursor(&self, key: &StoreKey, checkpoint: &CursorCheckpoint) -> Result<()>;

    /// Drop every checkpoint and dedup record of a source and start over
    async fn purge(&self, key: &StoreKey) -> Result<()>;
}

/// Per-source record of delivered event ids
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Create the dedup table for `key` if it does not exist yet
    async fn ensure_dedup(&self, key: &StoreKey) -> Result<()>;

    /// The subset of `ids` that is already recorded
    ///
    /// Requires a prior [`ensure_dedup`](DedupStore::ensure_dedup) for `key`.
    async fn existing_ids(&self, key: &StoreKey, ids: &[String]) -> Result<HashSet<String>>;

    /// Record `ids` as delivered at `recorded_at`
    async fn append_ids(
        &self,
        key: &StoreKey,
        ids: &[String],
        recorded_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// A store that keeps both checkpoints and dedup records
pub trait SyncStore: CheckpointStore + DedupStore {}

impl<T: CheckpointStore + DedupStore> SyncStore for T {}
