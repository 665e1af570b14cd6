//! Stale-while-revalidate caching for named collections.
//!
//! This module provides:
//! - An in-memory registry of collections with a status machine per key
//! - Request coalescing (one in-flight fetch per key) and an out-of-order guard
//! - A durable second tier (SQLite by default) with size and age eviction
//! - Typed subscriptions notified whenever fresher data lands

mod freshness;
mod manager;
mod registry;
mod storage;
mod topics;
mod traits;
mod writer;

pub use freshness::{age_display, age_of, Freshness, FreshnessPolicy, PolicySet};
pub use manager::{CacheSettings, CacheStats, FetchOptions, KeyStats, SmartCache};
pub use registry::CacheStatus;
pub use storage::{
  DurableStore, MemoryStorage, NoopStorage, PersistedRecord, RecordMeta, SqliteStorage,
  StoreLimits, StoreStats, RECORD_VERSION,
};
pub use topics::Subscription;
pub use traits::{CacheKey, Cacheable, PartitionKind};
