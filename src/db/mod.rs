//! Database layer for audit-sync
//!
//! Handles SQLite persistence for checkpoint logs and delivered-event ids.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations, per-source tables
//! - [`checkpoints`] - Range/windowed and cursor checkpoint logs
//! - [`dedup`] - Delivered-id membership and recording
//!
//! Per-source tables are named after a validated [`StoreKey`], which is the
//! only text ever spliced into SQL. All values are bound parameters.

use crate::error::Result;
use crate::types::{CursorCheckpoint, RangeCheckpoint, StoreKey, from_millis};
use sqlx::{FromRow, sqlite::SqlitePool};

mod checkpoints;
mod dedup;
mod migrations;

/// Maximum number of ids bound into a single membership query or insert
pub(crate) const MAX_IDS_PER_QUERY: usize = 500;

/// Range checkpoint row (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub(crate) struct RangeRow {
    pub start_ms: i64,
    pub end_ms: i64,
    pub success: bool,
    pub recorded_at_ms: i64,
}

impl TryFrom<RangeRow> for RangeCheckpoint {
    type Error = crate::Error;

    fn try_from(row: RangeRow) -> Result<Self> {
        Ok(RangeCheckpoint {
            start: from_millis(row.start_ms)?,
            end: from_millis(row.end_ms)?,
            success: row.success,
            recorded_at: from_millis(row.recorded_at_ms)?,
        })
    }
}

/// Cursor checkpoint row (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub(crate) struct CursorRow {
    pub last_id: i64,
    pub fetched_count: i64,
    pub recorded_at_ms: i64,
}

impl TryFrom<CursorRow> for CursorCheckpoint {
    type Error = crate::Error;

    fn try_from(row: CursorRow) -> Result<Self> {
        Ok(CursorCheckpoint {
            last_id: row.last_id,
            fetched_count: row.fetched_count,
            recorded_at: from_millis(row.recorded_at_ms)?,
        })
    }
}

/// Database handle for audit-sync
pub struct Database {
    pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

/// Table names of one source, derived from its store key
pub(crate) struct SourceTables {
    pub fetch: String,
    pub cursor: String,
    pub dedup: String,
}

impl SourceTables {
    pub(crate) fn for_key(key: &StoreKey) -> Self {
        Self {
            fetch: key.fetch_table(),
            cursor: key.cursor_table(),
            dedup: key.dedup_table(),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
