//! Range/windowed and cursor checkpoint logs.

use async_trait::async_trait;

use crate::Result;
use crate::error::Error;
use crate::store::CheckpointStore;
use crate::types::{CursorCheckpoint, RangeCheckpoint, StoreKey};

use super::{CursorRow, Database, RangeRow, SourceTables};

#[async_trait]
impl CheckpointStore for Database {
    async fn latest_range(&self, key: &StoreKey) -> Result<Option<RangeCheckpoint>> {
        self.ensure_source_tables(key).await?;
        let tables = SourceTables::for_key(key);

        let row = sqlx::query_as::<_, RangeRow>(&format!(
            "SELECT start_ms, end_ms, success, recorded_at_ms FROM {} ORDER BY id DESC LIMIT 1",
            tables.fetch
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::query("Failed to read latest range checkpoint", e))?;

        row.map(RangeCheckpoint::try_from).transpose()
    }

    async fn append_range(&self, key: &StoreKey, checkpoint: &RangeCheckpoint) -> Result<()> {
        self.ensure_source_tables(key).await?;
        let tables = SourceTables::for_key(key);

        sqlx::query(&format!(
            "INSERT INTO {} (start_ms, end_ms, success, recorded_at_ms) VALUES (?, ?, ?, ?)",
            tables.fetch
        ))
        .bind(checkpoint.start.timestamp_millis())
        .bind(checkpoint.end.timestamp_millis())
        .bind(checkpoint.success)
        .bind(checkpoint.recorded_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::query("Failed to append range checkpoint", e))?;

        Ok(())
    }

    async fn latest_cursor(&self, key: &StoreKey) -> Result<Option<CursorCheckpoint>> {
        self.ensure_source_tables(key).await?;
        let tables = SourceTables::for_key(key);

        let row = sqlx::query_as::<_, CursorRow>(&format!(
            "SELECT last_id, fetched_count, recorded_at_ms FROM {} ORDER BY id DESC LIMIT 1",
            tables.cursor
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::query("Failed to read latest cursor checkpoint", e))?;

        row.map(CursorCheckpoint::try_from).transpose()
    }

    async fn append_cursor(&self, key: &StoreKey, checkpoint: &CursorCheckpoint) -> Result<()> {
        self.ensure_source_tables(key).await?;
        let tables = SourceTables::for_key(key);

        sqlx::query(&format!(
            "INSERT INTO {} (last_id, fetched_count, recorded_at_ms) VALUES (?, ?, ?)",
            tables.cursor
        ))
        .bind(checkpoint.last_id)
        .bind(checkpoint.fetched_count)
        .bind(checkpoint.recorded_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::query("Failed to append cursor checkpoint", e))?;

        Ok(())
    }

    async fn purge(&self, key: &StoreKey) -> Result<()> {
        self.reset_source_tables(key).await
    }
}

impl Database {
    /// Full range checkpoint history of a source, oldest first
    pub async fn range_history(&self, key: &StoreKey) -> Result<Vec<RangeCheckpoint>> {
        self.ensure_source_tables(key).await?;
        let tables = SourceTables::for_key(key);

        let rows = sqlx::query_as::<_, RangeRow>(&format!(
            "SELECT start_ms, end_ms, success, recorded_at_ms FROM {} ORDER BY id ASC",
            tables.fetch
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("Failed to read range checkpoint history", e))?;

        rows.into_iter().map(RangeCheckpoint::try_from).collect()
    }

    /// Full cursor checkpoint history of a source, oldest first
    pub async fn cursor_history(&self, key: &StoreKey) -> Result<Vec<CursorCheckpoint>> {
        self.ensure_source_tables(key).await?;
        let tables = SourceTables::for_key(key);

        let rows = sqlx::query_as::<_, CursorRow>(&format!(
            "SELECT last_id, fetched_count, recorded_at_ms FROM {} ORDER BY id ASC",
            tables.cursor
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("Failed to read cursor checkpoint history", e))?;

        rows.into_iter().map(CursorCheckpoint::try_from).collect()
    }
}
