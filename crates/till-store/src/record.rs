//! # Record Envelope & Query Types
//!
//! Every persisted value is wrapped in a [`RecordEnvelope`] and stored
//! under a named logical collection.
//!
//! ## Persisted Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  collection "transactions"                                              │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ { id, payload: <QueuedTransaction JSON>, inserted_at,            │  │
//! │  │   metadata: { status: "pending", priority: "high",               │  │
//! │  │               timestamp: 1717000000000 } }                       │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  collection "conflicts"   → ConflictRecord envelopes                    │
//! │  collection "counters"    → receipt sequence                            │
//! │                                                                         │
//! │  Indexable metadata (status, priority, timestamp) supports ordered,    │
//! │  filtered retrieval without loading the full collection.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Record Metadata
// =============================================================================

/// Indexable metadata extracted from a record.
///
/// These fields are promoted to dedicated columns in the SQLite backend
/// so queries can filter and order server-side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Record status (e.g. sync status), if the record has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Record priority tier, if the record has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    /// Domain timestamp in epoch milliseconds (creation time of the
    /// underlying entity, not of the envelope).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl RecordMetadata {
    /// Metadata with only a domain timestamp.
    pub fn timestamped(at: DateTime<Utc>) -> Self {
        RecordMetadata {
            timestamp: Some(at.timestamp_millis()),
            ..Default::default()
        }
    }
}

// =============================================================================
// Record Envelope
// =============================================================================

/// A stored record: opaque payload plus indexable metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEnvelope {
    /// Record identifier, unique within its collection.
    pub id: String,

    /// The record content as JSON.
    pub payload: serde_json::Value,

    /// When the envelope was (last) written.
    pub inserted_at: DateTime<Utc>,

    /// Indexable metadata.
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl RecordEnvelope {
    /// Builds an envelope around a serializable value.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        value: &T,
        metadata: RecordMetadata,
    ) -> Result<Self, serde_json::Error> {
        Ok(RecordEnvelope {
            id: id.into(),
            payload: serde_json::to_value(value)?,
            inserted_at: Utc::now(),
            metadata,
        })
    }

    /// Deserializes the payload into a concrete type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Approximate size of the stored payload in bytes.
    pub fn approx_size(&self) -> u64 {
        self.payload.to_string().len() as u64
    }
}

// =============================================================================
// Record Query
// =============================================================================

/// An indexable field of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexField {
    Status,
    Priority,
    Timestamp,
}

impl IndexField {
    /// The backing column in the SQLite backend.
    pub const fn column(&self) -> &'static str {
        match self {
            IndexField::Status => "idx_status",
            IndexField::Priority => "idx_priority",
            IndexField::Timestamp => "idx_timestamp",
        }
    }
}

/// A filtered, ordered, paginated query over one collection.
///
/// Results are always ordered by domain timestamp ascending (oldest
/// first), then by envelope insertion time as a tiebreaker.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// Collection to query.
    pub collection: String,

    /// Optional index to filter on.
    pub index: Option<IndexField>,

    /// Value the index must equal (ignored without `index`).
    pub key: Option<String>,

    /// Maximum records to return.
    pub limit: Option<u32>,

    /// Records to skip before returning.
    pub offset: Option<u32>,
}

impl RecordQuery {
    /// Query returning a whole collection in timestamp order.
    pub fn all(collection: impl Into<String>) -> Self {
        RecordQuery {
            collection: collection.into(),
            ..Default::default()
        }
    }

    /// Query filtered on one index value.
    pub fn by_index(
        collection: impl Into<String>,
        index: IndexField,
        key: impl Into<String>,
    ) -> Self {
        RecordQuery {
            collection: collection.into(),
            index: Some(index),
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Caps the number of returned records.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` records.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

// =============================================================================
// Store Statistics
// =============================================================================

/// Which backend a store (or stat line) refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// SQLite document store (primary).
    Sqlite,
    /// JSON key-value files (fallback).
    KvFile,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::KvFile => write!(f, "kv_file"),
        }
    }
}

/// Aggregate storage statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total stored records across all collections.
    pub total_items: u64,

    /// Approximate total payload size in bytes.
    pub total_bytes: u64,

    /// Oldest envelope insertion time.
    pub oldest: Option<DateTime<Utc>>,

    /// Newest envelope insertion time.
    pub newest: Option<DateTime<Utc>>,

    /// The richest backend currently in use.
    pub backend: BackendKind,

    /// Remaining quota in bytes, when the platform exposes it.
    pub available_bytes: Option<u64>,
}

impl StoreStats {
    /// Empty stats for a given backend.
    pub fn empty(backend: BackendKind) -> Self {
        StoreStats {
            total_items: 0,
            total_bytes: 0,
            oldest: None,
            newest: None,
            backend,
            available_bytes: None,
        }
    }

    /// Merges another stat block into this one (counts add, time range
    /// widens, backend kind keeps the richer side).
    pub fn merge(&mut self, other: &StoreStats) {
        self.total_items += other.total_items;
        self.total_bytes += other.total_bytes;
        self.oldest = match (self.oldest, other.oldest) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.newest = match (self.newest, other.newest) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_envelope_round_trip() {
        let value = Sample {
            name: "till".into(),
            count: 3,
        };
        let envelope =
            RecordEnvelope::new("s-1", &value, RecordMetadata::default()).unwrap();
        assert_eq!(envelope.id, "s-1");

        let decoded: Sample = envelope.decode().unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_metadata_timestamped() {
        let now = Utc::now();
        let meta = RecordMetadata::timestamped(now);
        assert_eq!(meta.timestamp, Some(now.timestamp_millis()));
        assert!(meta.status.is_none());
    }

    #[test]
    fn test_query_builder() {
        let query = RecordQuery::by_index("transactions", IndexField::Status, "pending")
            .with_limit(10)
            .with_offset(5);
        assert_eq!(query.collection, "transactions");
        assert_eq!(query.index, Some(IndexField::Status));
        assert_eq!(query.key.as_deref(), Some("pending"));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, Some(5));
    }

    #[test]
    fn test_stats_merge() {
        let mut a = StoreStats::empty(BackendKind::Sqlite);
        a.total_items = 2;
        a.total_bytes = 100;

        let mut b = StoreStats::empty(BackendKind::KvFile);
        b.total_items = 1;
        b.total_bytes = 50;
        b.oldest = Some(Utc::now());
        b.newest = b.oldest;

        a.merge(&b);
        assert_eq!(a.total_items, 3);
        assert_eq!(a.total_bytes, 150);
        assert!(a.oldest.is_some());
        assert_eq!(a.backend, BackendKind::Sqlite);
    }
}
