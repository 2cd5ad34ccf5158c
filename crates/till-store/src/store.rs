//! # Record Store
//!
//! The storage facade the rest of the engine talks to. Picks the richest
//! available backend at initialization and degrades gracefully.
//!
//! ## Backend Selection & Write Fallback
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     RecordStore Decision Flow                           │
//! │                                                                         │
//! │  open(config)                                                          │
//! │       │                                                                 │
//! │       ├── SQLite opens?  ──yes──► primary = SQLite, fallback = files   │
//! │       │                                                                 │
//! │       └── no ────────────────────► primary = none,  fallback = files   │
//! │                                     (degraded but durable)             │
//! │                                                                         │
//! │  put(collection, record)                                               │
//! │       │                                                                 │
//! │       ├── primary.put ──ok──► clear stale fallback copy, done          │
//! │       │        │                                                        │
//! │       │      error                                                      │
//! │       │        ▼                                                        │
//! │       ├── fallback.put ──ok──► done (write attempt never lost)         │
//! │       │        │                                                        │
//! │       │      error                                                      │
//! │       │        ▼                                                        │
//! │       └── StoreError::WriteLost (fatal for this single operation)      │
//! │                                                                         │
//! │  get/query: primary first, fallback consulted for records that only    │
//! │  made it to the fallback (fallback copy wins on conflict: it is the    │
//! │  newer write by construction).                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::kv::KvFileBackend;
use crate::record::{BackendKind, RecordEnvelope, RecordQuery, StoreStats};
use crate::sqlite::{SqliteBackend, SqliteConfig};

// =============================================================================
// Configuration
// =============================================================================

/// Record store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the database file and the fallback files.
    pub data_dir: PathBuf,

    /// SQLite pool sizing for the primary backend.
    pub max_connections: u32,
}

impl StoreConfig {
    /// Creates a configuration rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        StoreConfig {
            data_dir: data_dir.into(),
            max_connections: 5,
        }
    }

    fn sqlite_config(&self) -> SqliteConfig {
        SqliteConfig::new(self.data_dir.join("till.db")).max_connections(self.max_connections)
    }

    fn fallback_dir(&self) -> PathBuf {
        self.data_dir.join("fallback")
    }
}

// =============================================================================
// Record Store
// =============================================================================

/// Durable record store with transparent write fallback.
///
/// This is the single source of truth for the engine: every component
/// reads and writes through it rather than keeping long-lived in-memory
/// copies.
#[derive(Debug)]
pub struct RecordStore {
    primary: Option<SqliteBackend>,
    fallback: KvFileBackend,
}

impl RecordStore {
    /// Opens the store, selecting the richest backend available.
    ///
    /// A failed SQLite open is logged and absorbed: the store degrades to
    /// the file fallback. Only failing to open the fallback as well is
    /// fatal.
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| StoreError::NoBackendAvailable(e.to_string()))?;

        let fallback = KvFileBackend::open(config.fallback_dir())
            .map_err(|e| StoreError::NoBackendAvailable(e.to_string()))?;

        let primary = match SqliteBackend::open(config.sqlite_config()).await {
            Ok(backend) => {
                info!("Record store using SQLite backend");
                Some(backend)
            }
            Err(e) => {
                warn!(?e, "SQLite backend unavailable, degrading to file fallback");
                None
            }
        };

        Ok(RecordStore { primary, fallback })
    }

    /// Opens an in-memory store (for testing).
    pub async fn open_in_memory(fallback_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let fallback = KvFileBackend::open(fallback_dir)
            .map_err(|e| StoreError::NoBackendAvailable(e.to_string()))?;
        let primary = Some(SqliteBackend::open(SqliteConfig::in_memory()).await?);
        Ok(RecordStore { primary, fallback })
    }

    /// The richest backend currently in use.
    pub fn backend_kind(&self) -> BackendKind {
        if self.primary.is_some() {
            BackendKind::Sqlite
        } else {
            BackendKind::KvFile
        }
    }

    /// Inserts or replaces a record.
    ///
    /// A failed primary write is retried against the fallback so the
    /// write attempt is never silently lost.
    pub async fn put(&self, collection: &str, envelope: &RecordEnvelope) -> StoreResult<()> {
        let primary_err = match &self.primary {
            Some(primary) => match primary.put(collection, envelope).await {
                Ok(()) => {
                    // The fallback may hold an older copy from a previous
                    // degraded write; the primary copy is now current.
                    self.fallback.remove(collection, &envelope.id).await.ok();
                    return Ok(());
                }
                Err(e) => Some(e),
            },
            None => None,
        };

        if let Some(ref e) = primary_err {
            warn!(?e, collection, id = %envelope.id, "Primary write failed, using fallback");
        }

        match self.fallback.put(collection, envelope).await {
            Ok(()) => Ok(()),
            Err(fallback_err) => match primary_err {
                Some(primary_err) => Err(StoreError::WriteLost {
                    primary: primary_err.to_string(),
                    fallback: fallback_err.to_string(),
                }),
                None => Err(fallback_err),
            },
        }
    }

    /// Fetches a single record by id, consulting both backends.
    pub async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<RecordEnvelope>> {
        // Fallback first: a copy there is newer by construction (it only
        // exists when a primary write failed after it).
        if let Some(envelope) = self.fallback.get(collection, id).await {
            return Ok(Some(envelope));
        }

        match &self.primary {
            Some(primary) => match primary.get(collection, id).await {
                Ok(result) => Ok(result),
                Err(e) => {
                    warn!(?e, collection, id, "Primary read failed");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Runs a filtered, ordered, paginated query across both backends.
    pub async fn query(&self, query: &RecordQuery) -> StoreResult<Vec<RecordEnvelope>> {
        // Filters are applied per-backend, but pagination must happen on
        // the merged result set, so the backends are queried unpaginated.
        let unpaginated = RecordQuery {
            limit: None,
            offset: None,
            ..query.clone()
        };

        let mut merged: HashMap<String, RecordEnvelope> = HashMap::new();

        if let Some(primary) = &self.primary {
            match primary.query(&unpaginated).await {
                Ok(records) => {
                    for record in records {
                        merged.insert(record.id.clone(), record);
                    }
                }
                Err(e) => warn!(?e, collection = %query.collection, "Primary query failed"),
            }
        }

        // Fallback copies override: they are the newer write when present.
        for record in self.fallback.query(&unpaginated).await {
            merged.insert(record.id.clone(), record);
        }

        let mut records: Vec<RecordEnvelope> = merged.into_values().collect();
        records.sort_by(|a, b| {
            (a.metadata.timestamp, a.inserted_at).cmp(&(b.metadata.timestamp, b.inserted_at))
        });

        let offset = query.offset.unwrap_or(0) as usize;
        let records = records.into_iter().skip(offset);
        Ok(match query.limit {
            Some(limit) => records.take(limit as usize).collect(),
            None => records.collect(),
        })
    }

    /// Removes a record from both backends.
    pub async fn remove(&self, collection: &str, id: &str) -> StoreResult<()> {
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.remove(collection, id).await {
                warn!(?e, collection, id, "Primary remove failed");
            }
        }
        self.fallback.remove(collection, id).await
    }

    /// Removes every record in a collection from both backends.
    pub async fn clear_collection(&self, collection: &str) -> StoreResult<()> {
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.clear_collection(collection).await {
                warn!(?e, collection, "Primary clear failed");
            }
        }
        self.fallback.clear_collection(collection).await
    }

    /// Counts records in one collection across both backends.
    ///
    /// Records present on both sides (stale primary copy awaiting a
    /// fallback promotion) are counted once.
    pub async fn count(&self, collection: &str) -> StoreResult<u64> {
        let records = self.query(&RecordQuery::all(collection)).await?;
        Ok(records.len() as u64)
    }

    /// Aggregate statistics across both backends.
    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = match &self.primary {
            Some(primary) => match primary.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(?e, "Primary stats failed");
                    StoreStats::empty(BackendKind::KvFile)
                }
            },
            None => StoreStats::empty(BackendKind::KvFile),
        };

        stats.merge(&self.fallback.stats().await);
        stats.backend = self.backend_kind();
        Ok(stats)
    }

    /// Closes the primary backend. Subsequent writes flow to the fallback.
    pub async fn close(&self) {
        if let Some(primary) = &self.primary {
            primary.close().await;
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{IndexField, RecordMetadata};
    use chrono::Utc;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("till-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
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
    async fn test_put_get_through_primary() {
        let store = RecordStore::open_in_memory(temp_dir()).await.unwrap();
        store.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();

        let fetched = store.get("transactions", "r-1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "r-1");
        assert_eq!(store.backend_kind(), BackendKind::Sqlite);
    }

    #[tokio::test]
    async fn test_write_falls_back_when_primary_closed() {
        let store = RecordStore::open_in_memory(temp_dir()).await.unwrap();

        // Simulated primary failure: pool closed, every write now errors
        store.close().await;

        store.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();

        // The record is still retrievable through the same store
        let fetched = store.get("transactions", "r-1").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.status.as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn test_fallback_survives_restart() {
        let dir = temp_dir();

        {
            let store = RecordStore::open_in_memory(&dir).await.unwrap();
            store.close().await; // primary broken from here on
            store.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();
        }

        // Simulated process restart where only the fallback files remain
        // (the primary was an in-memory database).
        let reopened = RecordStore::open_in_memory(&dir).await.unwrap();
        let fetched = reopened.get("transactions", "r-1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "r-1");
    }

    #[tokio::test]
    async fn test_query_merges_fallback_records() {
        let store = RecordStore::open_in_memory(temp_dir()).await.unwrap();
        store.put("transactions", &envelope("r-1", "pending", 10)).await.unwrap();

        // Degrade, then write another record that only reaches the fallback
        store.close().await;
        store.put("transactions", &envelope("r-2", "pending", 5)).await.unwrap();

        let results = store
            .query(&RecordQuery::by_index("transactions", IndexField::Status, "pending"))
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|e| e.id.as_str()).collect();
        // Note: with the primary closed, only the fallback record is
        // visible; the primary copy of r-1 is unreachable until reopen.
        assert_eq!(ids, vec!["r-2"]);
    }

    #[tokio::test]
    async fn test_fallback_copy_wins_over_stale_primary() {
        let store = RecordStore::open_in_memory(temp_dir()).await.unwrap();
        store.put("transactions", &envelope("r-1", "pending", 10)).await.unwrap();

        // Write a newer version directly into the fallback, as the store
        // would after a failed primary write.
        let newer = envelope("r-1", "failed", 10);
        store.fallback.put("transactions", &newer).await.unwrap();

        let fetched = store.get("transactions", "r-1").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.status.as_deref(), Some("failed"));

        // A successful primary write clears the stale fallback copy
        store.put("transactions", &envelope("r-1", "synced", 10)).await.unwrap();
        assert!(store.fallback.get("transactions", "r-1").await.is_none());
        let fetched = store.get("transactions", "r-1").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.status.as_deref(), Some("synced"));
    }

    #[tokio::test]
    async fn test_stats_combined() {
        let store = RecordStore::open_in_memory(temp_dir()).await.unwrap();
        store.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();

        store.close().await;
        store.put("transactions", &envelope("r-2", "pending", 2)).await.unwrap();

        let stats = store.stats().await.unwrap();
        // r-2 lives in the fallback; primary stats are unavailable after
        // close, so the combined count covers the reachable record.
        assert!(stats.total_items >= 1);
        assert_eq!(stats.backend, BackendKind::Sqlite);
    }
}
