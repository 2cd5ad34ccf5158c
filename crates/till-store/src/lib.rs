//! # till-store: Durable Record Store for Till POS
//!
//! This crate persists queued transactions and sync metadata across
//! process restarts, picking the best available backend and degrading
//! gracefully.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Till POS Data Flow                               │
//! │                                                                         │
//! │  till-sync (queue worker, conflict engine)                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     till-store (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  RecordStore  │    │ SqliteBackend │    │ KvFileBackend│  │   │
//! │  │   │  (store.rs)   │    │ (sqlite.rs)   │    │   (kv.rs)    │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ Backend pick  │◄───│ WAL pool +    │    │ JSON file    │  │   │
//! │  │   │ + transparent │    │ records table │    │ per          │  │   │
//! │  │   │ write fallback│    │ + migrations  │    │ collection   │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  <data_dir>/till.db (+WAL)  and  <data_dir>/fallback/*.json            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`record`] - Record envelope, query, and statistics types
//! - [`sqlite`] - Primary backend (SQLite document store, embedded migrations)
//! - [`kv`] - Fallback backend (JSON file per collection)
//! - [`store`] - The [`RecordStore`] facade with transparent write fallback
//! - [`error`] - Storage error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use till_store::{RecordStore, StoreConfig, RecordEnvelope, RecordMetadata};
//!
//! let store = RecordStore::open(StoreConfig::new("/var/lib/till-pos")).await?;
//!
//! let envelope = RecordEnvelope::new("txn-1", &transaction, metadata)?;
//! store.put("transactions", &envelope).await?;
//!
//! let pending = store
//!     .query(&RecordQuery::by_index("transactions", IndexField::Status, "pending"))
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod kv;
pub mod record;
pub mod sqlite;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use kv::KvFileBackend;
pub use record::{
    BackendKind, IndexField, RecordEnvelope, RecordMetadata, RecordQuery, StoreStats,
};
pub use sqlite::{SqliteBackend, SqliteConfig};
pub use store::{RecordStore, StoreConfig};
