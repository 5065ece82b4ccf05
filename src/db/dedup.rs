//! Delivered-id membership and recording.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::Result;
use crate::error::Error;
use crate::store::DedupStore;
use crate::types::StoreKey;

use super::{Database, MAX_IDS_PER_QUERY, SourceTables};

#[async_trait]
impl DedupStore for Database {
    async fn ensure_dedup(&self, key: &StoreKey) -> Result<()> {
        self.ensure_source_tables(key).await
    }

    /// Membership is checked in chunks so the bound-variable limit is never hit.
    async fn existing_ids(&self, key: &StoreKey, ids: &[String]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        if ids.is_empty() {
            return Ok(found);
        }

        let tables = SourceTables::for_key(key);

        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let mut query_builder = sqlx::QueryBuilder::new(format!(
                "SELECT DISTINCT id FROM {} WHERE id IN (",
                tables.dedup
            ));

            let mut separated = query_builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            let rows: Vec<String> = query_builder
                .build_query_scalar()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::query("Failed to query delivered ids", e))?;

            found.extend(rows);
        }

        Ok(found)
    }

    async fn append_ids(
        &self,
        key: &StoreKey,
        ids: &[String],
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        self.ensure_source_tables(key).await?;
        let tables = SourceTables::for_key(key);
        let recorded_at_ms = recorded_at.timestamp_millis();

        // 2 bind variables per id
        for chunk in ids.chunks(MAX_IDS_PER_QUERY / 2) {
            let mut query_builder = sqlx::QueryBuilder::new(format!(
                "INSERT INTO {} (id, recorded_at_ms) ",
                tables.dedup
            ));

            query_builder.push_values(chunk, |mut b, id| {
                b.push_bind(id).push_bind(recorded_at_ms);
            });

            query_builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| Error::query("Failed to record delivered ids", e))?;
        }

        Ok(())
    }
}

impl Database {
    /// Number of recorded id rows of a source, duplicates included
    pub async fn dedup_row_count(&self, key: &StoreKey) -> Result<i64> {
        self.ensure_source_tables(key).await?;
        let tables = SourceTables::for_key(key);

        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", tables.dedup))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::query("Failed to count delivered ids", e))
    }
}
