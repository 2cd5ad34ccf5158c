//! # SQLite Backend
//!
//! The primary record-store backend: an embedded document store over a
//! single SQLite table.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SQLite Backend                                     │
//! │                                                                         │
//! │  SqliteConfig::new(path) ← Configure pool settings                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SqliteBackend::open(config).await ← Create pool + run migrations      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────┐                           │
//! │  │            SqlitePool                    │                           │
//! │  │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐       │                           │
//! │  │  │Conn1│ │Conn2│ │Conn3│ │Conn4│ ...   │  (max_connections)        │
//! │  │  └─────┘ └─────┘ └─────┘ └─────┘       │                           │
//! │  └─────────────────────────────────────────┘                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  records (collection, id, payload, inserted_at,                        │
//! │           idx_status, idx_priority, idx_timestamp, metadata)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL (Write-Ahead Logging) mode is enabled for:
//! - Better concurrent read performance
//! - Readers don't block writers
//! - Better crash recovery
//!
//! ## Why the runtime query API?
//! Collections and index columns are chosen at runtime, which the
//! compile-time checked `query!` macros cannot express. All SQL here is
//! static except the index column name, which comes from a closed enum.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::record::{RecordEnvelope, RecordMetadata, RecordQuery, StoreStats};
use crate::record::BackendKind;

// =============================================================================
// Migrations
// =============================================================================

/// Embedded migrations from the workspace `migrations/sqlite` directory.
///
/// The `sqlx::migrate!()` macro embeds all SQL files into the binary at
/// compile time. No runtime file access needed. Idempotent: applied
/// migrations are tracked in `_sqlx_migrations`.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

// =============================================================================
// Configuration
// =============================================================================

/// SQLite backend configuration.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 5 (sufficient for a single terminal)
    pub max_connections: u32,

    /// Connection timeout duration.
    pub connect_timeout: Duration,

    /// Whether to run migrations on connect.
    pub run_migrations: bool,
}

impl SqliteConfig {
    /// Creates a new configuration with the given database path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteConfig {
            database_path: path.into(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(30),
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// ## Usage
    /// ```rust,ignore
    /// let backend = SqliteBackend::open(SqliteConfig::in_memory()).await?;
    /// // Database is isolated, perfect for tests
    /// ```
    pub fn in_memory() -> Self {
        SqliteConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1, // In-memory requires single connection
            connect_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

/// Raw row shape for the `records` table.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    payload: String,
    inserted_at: DateTime<Utc>,
    idx_status: Option<String>,
    idx_priority: Option<String>,
    idx_timestamp: Option<i64>,
}

impl RecordRow {
    fn into_envelope(self) -> StoreResult<RecordEnvelope> {
        Ok(RecordEnvelope {
            id: self.id,
            payload: serde_json::from_str(&self.payload)?,
            inserted_at: self.inserted_at,
            metadata: RecordMetadata {
                status: self.idx_status,
                priority: self.idx_priority,
                timestamp: self.idx_timestamp,
            },
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    total_items: i64,
    total_bytes: i64,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
}

// =============================================================================
// SQLite Backend
// =============================================================================

/// Primary storage backend over SQLite.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Opens the backend: creates the pool and runs migrations.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures SQLite for a local terminal:
    ///    - WAL mode for concurrent reads
    ///    - NORMAL synchronous (balance of safety/speed)
    /// 3. Creates the connection pool
    /// 4. Runs migrations (if enabled)
    pub async fn open(config: SqliteConfig) -> StoreResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Opening SQLite record store"
        );

        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            // WAL mode: readers don't block writers, writers don't block readers
            .journal_mode(SqliteJournalMode::Wal)
            // NORMAL synchronous: data is safe from corruption, may lose
            // the last transaction on power loss
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!(
            max_connections = config.max_connections,
            "SQLite pool created"
        );

        let backend = SqliteBackend { pool };

        if config.run_migrations {
            MIGRATOR.run(&backend.pool).await?;
            debug!("Record store migrations applied");
        }

        Ok(backend)
    }

    /// Inserts or replaces a record in a collection.
    pub async fn put(&self, collection: &str, envelope: &RecordEnvelope) -> StoreResult<()> {
        let payload = serde_json::to_string(&envelope.payload)?;
        let metadata = serde_json::to_string(&envelope.metadata)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO records (
                collection, id, payload, inserted_at,
                idx_status, idx_priority, idx_timestamp, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(collection)
        .bind(&envelope.id)
        .bind(payload)
        .bind(envelope.inserted_at)
        .bind(&envelope.metadata.status)
        .bind(&envelope.metadata.priority)
        .bind(envelope.metadata.timestamp)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetches a single record by id.
    pub async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<RecordEnvelope>> {
        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, payload, inserted_at, idx_status, idx_priority, idx_timestamp
            FROM records
            WHERE collection = ?1 AND id = ?2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::into_envelope).transpose()
    }

    /// Runs a filtered, ordered, paginated query.
    ///
    /// Results are ordered by domain timestamp ascending (oldest first),
    /// then by envelope insertion time.
    pub async fn query(&self, query: &RecordQuery) -> StoreResult<Vec<RecordEnvelope>> {
        // The index column name comes from a closed enum, never from input.
        let sql = match (&query.index, &query.key) {
            (Some(index), Some(_)) => format!(
                "SELECT id, payload, inserted_at, idx_status, idx_priority, idx_timestamp \
                 FROM records \
                 WHERE collection = ?1 AND {} = ?2 \
                 ORDER BY idx_timestamp ASC, inserted_at ASC \
                 LIMIT ?3 OFFSET ?4",
                index.column()
            ),
            _ => "SELECT id, payload, inserted_at, idx_status, idx_priority, idx_timestamp \
                  FROM records \
                  WHERE collection = ?1 \
                  ORDER BY idx_timestamp ASC, inserted_at ASC \
                  LIMIT ?2 OFFSET ?3"
                .to_string(),
        };

        // SQLite treats LIMIT -1 as "no limit"
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let offset = query.offset.map(|o| o as i64).unwrap_or(0);

        let mut q = sqlx::query_as::<_, RecordRow>(&sql).bind(&query.collection);
        if let (Some(_), Some(key)) = (&query.index, &query.key) {
            q = q.bind(key);
        }
        let rows = q.bind(limit).bind(offset).fetch_all(&self.pool).await?;

        rows.into_iter().map(RecordRow::into_envelope).collect()
    }

    /// Removes a record. Removing a missing record is not an error.
    pub async fn remove(&self, collection: &str, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM records WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Removes every record in a collection.
    pub async fn clear_collection(&self, collection: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM records WHERE collection = ?1")
            .bind(collection)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Counts records in one collection.
    pub async fn count(&self, collection: &str) -> StoreResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?1")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }

    /// Aggregate statistics across all collections.
    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*)                          AS total_items,
                COALESCE(SUM(LENGTH(payload)), 0) AS total_bytes,
                MIN(inserted_at)                  AS oldest,
                MAX(inserted_at)                  AS newest
            FROM records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            total_items: row.total_items as u64,
            total_bytes: row.total_bytes as u64,
            oldest: row.oldest,
            newest: row.newest,
            backend: BackendKind::Sqlite,
            available_bytes: None,
        })
    }

    /// Checks if the backend can execute queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Closes the connection pool. All subsequent operations will fail.
    pub async fn close(&self) {
        info!("Closing SQLite record store");
        self.pool.close().await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IndexField;

    async fn backend() -> SqliteBackend {
        SqliteBackend::open(SqliteConfig::in_memory()).await.unwrap()
    }

    fn envelope(id: &str, status: &str, timestamp: i64) -> RecordEnvelope {
        RecordEnvelope {
            id: id.to_string(),
            payload: serde_json::json!({ "id": id, "status": status }),
            inserted_at: Utc::now(),
            metadata: RecordMetadata {
                status: Some(status.to_string()),
                priority: None,
                timestamp: Some(timestamp),
            },
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let backend = backend().await;
        let env = envelope("r-1", "pending", 100);

        backend.put("transactions", &env).await.unwrap();

        let fetched = backend.get("transactions", "r-1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "r-1");
        assert_eq!(fetched.metadata.status.as_deref(), Some("pending"));
        assert_eq!(fetched.payload, env.payload);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let backend = backend().await;
        assert!(backend.get("transactions", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_existing() {
        let backend = backend().await;
        backend.put("transactions", &envelope("r-1", "pending", 100)).await.unwrap();
        backend.put("transactions", &envelope("r-1", "synced", 100)).await.unwrap();

        let fetched = backend.get("transactions", "r-1").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.status.as_deref(), Some("synced"));
        assert_eq!(backend.count("transactions").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_by_index_ordered() {
        let backend = backend().await;
        backend.put("transactions", &envelope("r-2", "pending", 200)).await.unwrap();
        backend.put("transactions", &envelope("r-1", "pending", 100)).await.unwrap();
        backend.put("transactions", &envelope("r-3", "synced", 50)).await.unwrap();

        let query = RecordQuery::by_index("transactions", IndexField::Status, "pending");
        let results = backend.query(&query).await.unwrap();

        let ids: Vec<_> = results.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "r-2"]); // timestamp ascending
    }

    #[tokio::test]
    async fn test_query_limit_offset() {
        let backend = backend().await;
        for i in 0..5 {
            backend
                .put("transactions", &envelope(&format!("r-{i}"), "pending", i))
                .await
                .unwrap();
        }

        let query = RecordQuery::all("transactions").with_limit(2).with_offset(1);
        let results = backend.query(&query).await.unwrap();
        let ids: Vec<_> = results.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "r-2"]);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let backend = backend().await;
        backend.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();
        backend.put("conflicts", &envelope("c-1", "pending", 1)).await.unwrap();

        assert_eq!(backend.count("transactions").await.unwrap(), 1);
        assert_eq!(backend.count("conflicts").await.unwrap(), 1);

        backend.clear_collection("transactions").await.unwrap();
        assert_eq!(backend.count("transactions").await.unwrap(), 0);
        assert_eq!(backend.count("conflicts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let backend = backend().await;
        backend.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();
        backend.remove("transactions", "r-1").await.unwrap();
        backend.remove("transactions", "r-1").await.unwrap(); // no error
        assert!(backend.get("transactions", "r-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let backend = backend().await;
        assert_eq!(backend.stats().await.unwrap().total_items, 0);

        backend.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();
        backend.put("conflicts", &envelope("c-1", "pending", 1)).await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.total_items, 2);
        assert!(stats.total_bytes > 0);
        assert!(stats.oldest.is_some());
        assert_eq!(stats.backend, BackendKind::Sqlite);
    }
}
