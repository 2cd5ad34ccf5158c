//! # Key-Value File Backend
//!
//! The fallback record-store backend: one JSON file per collection,
//! mirrored in memory.
//!
//! ## Role
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Fallback Backend                                  │
//! │                                                                         │
//! │  The SQLite backend is preferred. This backend exists so that:         │
//! │                                                                         │
//! │  1. A terminal whose SQLite store cannot open still persists sales     │
//! │     (degraded but durable).                                            │
//! │  2. A single failed SQLite write is transparently retried here,       │
//! │     a write attempt is never silently lost.                           │
//! │                                                                         │
//! │  Layout:  <data_dir>/fallback/<collection>.json                        │
//! │           { "<id>": { id, payload, inserted_at, metadata }, ... }      │
//! │                                                                         │
//! │  Files are loaded into memory at open and rewritten on every          │
//! │  mutation. Collections here are small (the offline queue is           │
//! │  capacity-bounded), so whole-file rewrites are acceptable.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::record::{BackendKind, IndexField, RecordEnvelope, RecordQuery, StoreStats};

type CollectionMap = HashMap<String, RecordEnvelope>;

// =============================================================================
// KV File Backend
// =============================================================================

/// File-backed key-value fallback store.
pub struct KvFileBackend {
    /// Directory holding one JSON file per collection.
    dir: PathBuf,

    /// In-memory mirror of all collections.
    collections: RwLock<HashMap<String, CollectionMap>>,
}

impl KvFileBackend {
    /// Opens the backend, loading any existing collection files.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut collections = HashMap::new();

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match Self::load_collection(&path) {
                Ok(map) => {
                    debug!(collection = name, records = map.len(), "Loaded fallback collection");
                    collections.insert(name.to_string(), map);
                }
                Err(e) => {
                    // A corrupt fallback file must not take the whole store
                    // down; the primary backend still has the durable copy.
                    warn!(?e, collection = name, "Skipping unreadable fallback file");
                }
            }
        }

        Ok(KvFileBackend {
            dir,
            collections: RwLock::new(collections),
        })
    }

    fn load_collection(path: &Path) -> StoreResult<CollectionMap> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.json"))
    }

    /// Rewrites one collection file from the in-memory map.
    fn persist(&self, collection: &str, map: &CollectionMap) -> StoreResult<()> {
        let path = self.collection_path(collection);
        let contents = serde_json::to_string(map)?;
        std::fs::write(&path, contents)?;
        Ok(())
    }

    /// Inserts or replaces a record.
    pub async fn put(&self, collection: &str, envelope: &RecordEnvelope) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        let map = collections.entry(collection.to_string()).or_default();
        map.insert(envelope.id.clone(), envelope.clone());
        self.persist(collection, map)
    }

    /// Fetches a single record by id.
    pub async fn get(&self, collection: &str, id: &str) -> Option<RecordEnvelope> {
        let collections = self.collections.read().await;
        collections.get(collection).and_then(|map| map.get(id)).cloned()
    }

    /// Runs a filtered, ordered, paginated query.
    pub async fn query(&self, query: &RecordQuery) -> Vec<RecordEnvelope> {
        let collections = self.collections.read().await;
        let Some(map) = collections.get(&query.collection) else {
            return Vec::new();
        };

        let mut records: Vec<RecordEnvelope> = map
            .values()
            .filter(|envelope| Self::matches(envelope, query))
            .cloned()
            .collect();

        records.sort_by(|a, b| {
            (a.metadata.timestamp, a.inserted_at).cmp(&(b.metadata.timestamp, b.inserted_at))
        });

        let offset = query.offset.unwrap_or(0) as usize;
        let records = records.into_iter().skip(offset);
        match query.limit {
            Some(limit) => records.take(limit as usize).collect(),
            None => records.collect(),
        }
    }

    fn matches(envelope: &RecordEnvelope, query: &RecordQuery) -> bool {
        let (Some(index), Some(key)) = (&query.index, &query.key) else {
            return true;
        };

        match index {
            IndexField::Status => envelope.metadata.status.as_deref() == Some(key.as_str()),
            IndexField::Priority => envelope.metadata.priority.as_deref() == Some(key.as_str()),
            IndexField::Timestamp => envelope
                .metadata
                .timestamp
                .map(|t| t.to_string() == *key)
                .unwrap_or(false),
        }
    }

    /// Removes a record. Removing a missing record is a cheap no-op that
    /// touches no file.
    pub async fn remove(&self, collection: &str, id: &str) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        let Some(map) = collections.get_mut(collection) else {
            return Ok(());
        };

        if map.remove(id).is_some() {
            self.persist(collection, map)?;
        }
        Ok(())
    }

    /// Removes every record in a collection.
    pub async fn clear_collection(&self, collection: &str) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        if let Some(map) = collections.get_mut(collection) {
            map.clear();
        }

        let path = self.collection_path(collection);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Counts records in one collection.
    pub async fn count(&self, collection: &str) -> u64 {
        let collections = self.collections.read().await;
        collections.get(collection).map(|m| m.len() as u64).unwrap_or(0)
    }

    /// Aggregate statistics across all collections.
    pub async fn stats(&self) -> StoreStats {
        let collections = self.collections.read().await;

        let mut stats = StoreStats::empty(BackendKind::KvFile);
        for map in collections.values() {
            for envelope in map.values() {
                stats.total_items += 1;
                stats.total_bytes += envelope.approx_size();
                stats.oldest = Some(match stats.oldest {
                    Some(t) => t.min(envelope.inserted_at),
                    None => envelope.inserted_at,
                });
                stats.newest = Some(match stats.newest {
                    Some(t) => t.max(envelope.inserted_at),
                    None => envelope.inserted_at,
                });
            }
        }
        stats
    }
}

impl std::fmt::Debug for KvFileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvFileBackend").field("dir", &self.dir).finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordMetadata;
    use chrono::Utc;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("till-kv-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn envelope(id: &str, status: &str, timestamp: i64) -> RecordEnvelope {
        RecordEnvelope {
            id: id.to_string(),
            payload: serde_json::json!({ "id": id }),
            inserted_at: Utc::now(),
            metadata: RecordMetadata {
                status: Some(status.to_string()),
                priority: None,
                timestamp: Some(timestamp),
            },
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let backend = KvFileBackend::open(temp_dir()).unwrap();

        backend.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();
        assert!(backend.get("transactions", "r-1").await.is_some());

        backend.remove("transactions", "r-1").await.unwrap();
        assert!(backend.get("transactions", "r-1").await.is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = temp_dir();

        {
            let backend = KvFileBackend::open(&dir).unwrap();
            backend.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();
        }

        // Simulated process restart: fresh instance over the same directory
        let reopened = KvFileBackend::open(&dir).unwrap();
        let fetched = reopened.get("transactions", "r-1").await.unwrap();
        assert_eq!(fetched.metadata.status.as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn test_query_filter_and_order() {
        let backend = KvFileBackend::open(temp_dir()).unwrap();
        backend.put("transactions", &envelope("r-2", "pending", 20)).await.unwrap();
        backend.put("transactions", &envelope("r-1", "pending", 10)).await.unwrap();
        backend.put("transactions", &envelope("r-3", "failed", 5)).await.unwrap();

        let query = RecordQuery::by_index("transactions", IndexField::Status, "pending");
        let results = backend.query(&query).await;
        let ids: Vec<_> = results.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "r-2"]);
    }

    #[tokio::test]
    async fn test_clear_collection_removes_file() {
        let dir = temp_dir();
        let backend = KvFileBackend::open(&dir).unwrap();
        backend.put("transactions", &envelope("r-1", "pending", 1)).await.unwrap();
        assert!(dir.join("transactions.json").exists());

        backend.clear_collection("transactions").await.unwrap();
        assert!(!dir.join("transactions.json").exists());
        assert_eq!(backend.count("transactions").await, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let backend = KvFileBackend::open(temp_dir()).unwrap();
        backend.put("a", &envelope("r-1", "pending", 1)).await.unwrap();
        backend.put("b", &envelope("r-2", "pending", 2)).await.unwrap();

        let stats = backend.stats().await;
        assert_eq!(stats.total_items, 2);
        assert!(stats.total_bytes > 0);
        assert_eq!(stats.backend, BackendKind::KvFile);
    }
}
