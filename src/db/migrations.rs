//! Opening the database, versioned schema upgrades and per-source tables.
//!
//! Shared tables are created by the numbered steps in [`SCHEMA`]. The tables
//! of one source are created lazily on first access, named after its
//! [`StoreKey`], and listed in `sync_sources`.

use crate::error::DatabaseError;
use crate::types::StoreKey;
use crate::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::{Connection, SqliteConnection};
use std::path::Path;
use std::str::FromStr;

use super::{Database, SourceTables};

/// Schema steps, applied in order to databases below their version
const SCHEMA: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE sync_sources (
        store_key TEXT PRIMARY KEY,
        created_at_ms INTEGER NOT NULL
    )",
)];

fn unreachable_db(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Database(DatabaseError::ConnectionFailed(format!("{context}: {e}")))
}

fn migration_failed(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Database(DatabaseError::MigrationFailed(format!("{context}: {e}")))
}

impl Database {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| unreachable_db("Cannot create database directory", e))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| unreachable_db("Invalid database path", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| unreachable_db("Cannot open database", e))?;

        let db = Self { pool };
        db.upgrade_schema().await?;
        Ok(db)
    }

    async fn connection(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| unreachable_db("No database connection available", e))
    }

    async fn upgrade_schema(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| migration_failed("Cannot create schema_version", e))?;

        let installed: i64 =
            sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(version) FROM schema_version")
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| Error::query("Cannot read schema version", e))?
                .unwrap_or(0);

        for &(version, ddl) in SCHEMA.iter().filter(|(v, _)| *v > installed) {
            Self::apply_step(&mut conn, version, ddl).await?;
        }
        Ok(())
    }

    /// One schema step and its version row, all or nothing
    async fn apply_step(conn: &mut SqliteConnection, version: i64, ddl: &str) -> Result<()> {
        tracing::info!(version, "Upgrading database schema");

        let mut tx = conn
            .begin()
            .await
            .map_err(|e| migration_failed("Cannot start schema upgrade", e))?;

        sqlx::query(ddl)
            .execute(&mut *tx)
            .await
            .map_err(|e| migration_failed(&format!("Schema step {version} failed"), e))?;
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| migration_failed("Cannot record schema version", e))?;

        tx.commit()
            .await
            .map_err(|e| migration_failed(&format!("Cannot commit schema step {version}"), e))
    }

    /// Make sure the checkpoint and dedup tables of `key` exist
    ///
    /// Idempotent, and safe for concurrent callers on the same key.
    pub async fn ensure_source_tables(&self, key: &StoreKey) -> Result<()> {
        let mut conn = self.connection().await?;
        Self::create_source_tables(&mut conn, key).await
    }

    async fn create_source_tables(conn: &mut SqliteConnection, key: &StoreKey) -> Result<()> {
        let SourceTables {
            fetch,
            cursor,
            dedup,
        } = SourceTables::for_key(key);

        let ddl = [
            format!(
                "CREATE TABLE IF NOT EXISTS {fetch} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    start_ms INTEGER NOT NULL,
                    end_ms INTEGER NOT NULL,
                    success INTEGER NOT NULL,
                    recorded_at_ms INTEGER NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {cursor} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    last_id INTEGER NOT NULL,
                    fetched_count INTEGER NOT NULL,
                    recorded_at_ms INTEGER NOT NULL
                )"
            ),
            // Not unique: concurrent writers may record the same id twice
            format!(
                "CREATE TABLE IF NOT EXISTS {dedup} (
                    id TEXT NOT NULL,
                    recorded_at_ms INTEGER NOT NULL
                )"
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{dedup}_id ON {dedup}(id)"),
        ];

        for statement in &ddl {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| Error::query(&format!("Cannot create tables for {key}"), e))?;
        }

        sqlx::query("INSERT OR IGNORE INTO sync_sources (store_key, created_at_ms) VALUES (?, ?)")
            .bind(key.as_str())
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::query(&format!("Cannot register store key {key}"), e))?;
        Ok(())
    }

    /// Store keys that have tables, in ascending order
    pub async fn list_store_keys(&self) -> Result<Vec<StoreKey>> {
        sqlx::query_scalar::<_, String>("SELECT store_key FROM sync_sources ORDER BY store_key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::query("Cannot list store keys", e))?
            .into_iter()
            .map(StoreKey::new)
            .collect()
    }

    /// Drop and recreate the tables of `key` atomically
    pub(crate) async fn reset_source_tables(&self, key: &StoreKey) -> Result<()> {
        let tables = SourceTables::for_key(key);
        let mut conn = self.connection().await?;
        let mut tx = conn
            .begin()
            .await
            .map_err(|e| Error::query("Cannot start purge", e))?;

        for table in [&tables.fetch, &tables.cursor, &tables.dedup] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::query(&format!("Cannot drop {table}"), e))?;
        }
        Self::create_source_tables(&mut tx, key).await?;

        tx.commit()
            .await
            .map_err(|e| Error::query("Cannot commit purge", e))?;

        tracing::info!(store_key = %key, "Source tables purged");
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// The underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
