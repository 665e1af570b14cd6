//! Durable store trait and its SQLite, in-memory and no-op backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::StoreError;

/// Format version of persisted payloads; records with another version are
/// discarded on load.
pub const RECORD_VERSION: u32 = 1;

/// A collection as written to the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
  pub key: String,
  /// JSON-encoded `Vec<T>`
  pub data: Vec<u8>,
  pub saved_at: DateTime<Utc>,
  pub version: u32,
  pub item_count: usize,
  /// SHA-256 of `data`, hex encoded
  pub checksum: String,
}

impl PersistedRecord {
  pub fn encode<T: Serialize>(
    key: impl Into<String>,
    items: &[T],
    saved_at: DateTime<Utc>,
  ) -> Result<Self, StoreError> {
    let data = serde_json::to_vec(items)?;
    Ok(Self {
      key: key.into(),
      checksum: checksum(&data),
      data,
      saved_at,
      version: RECORD_VERSION,
      item_count: items.len(),
    })
  }

  pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
    Ok(serde_json::from_slice(&self.data)?)
  }

  pub fn size(&self) -> u64 {
    self.data.len() as u64
  }

  fn meta(&self) -> RecordMeta {
    RecordMeta {
      key: self.key.clone(),
      saved_at: self.saved_at,
      bytes: self.size(),
      item_count: self.item_count,
      version: self.version,
    }
  }
}

pub fn checksum(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

/// Everything about a record except its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
  pub key: String,
  pub saved_at: DateTime<Utc>,
  pub bytes: u64,
  pub item_count: usize,
  pub version: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
  pub total_keys: usize,
  pub total_bytes: u64,
}

/// Size and age ceilings enforced on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
  pub max_bytes: u64,
  pub max_age: Duration,
}

impl Default for StoreLimits {
  fn default() -> Self {
    Self {
      max_bytes: 25 * 1024 * 1024,
      max_age: Duration::days(7),
    }
  }
}

/// Keys to evict so that a payload of `incoming` bytes for `key` fits.
///
/// Records older than `max_age` always go; after that the oldest records are
/// evicted until the total fits. A payload larger than the whole capacity
/// cannot fit at all.
pub fn plan_eviction(
  existing: &[RecordMeta],
  key: &str,
  incoming: u64,
  limits: &StoreLimits,
  now: DateTime<Utc>,
) -> Result<Vec<String>, StoreError> {
  if incoming > limits.max_bytes {
    return Err(StoreError::QuotaExceeded {
      needed: incoming,
      capacity: limits.max_bytes,
    });
  }

  let cutoff = now - limits.max_age;
  let mut victims = Vec::new();
  let mut kept: Vec<&RecordMeta> = Vec::new();
  for meta in existing.iter().filter(|m| m.key != key) {
    if meta.saved_at < cutoff {
      victims.push(meta.key.clone());
    } else {
      kept.push(meta);
    }
  }

  kept.sort_by_key(|m| m.saved_at);
  let mut total: u64 = kept.iter().map(|m| m.bytes).sum::<u64>() + incoming;
  for meta in kept {
    if total <= limits.max_bytes {
      break;
    }
    total -= meta.bytes;
    victims.push(meta.key.clone());
  }

  Ok(victims)
}

/// Trait for durable store backends.
///
/// Only the cache manager writes through this; it funnels writes through a
/// single task so implementations see them in order.
pub trait DurableStore: Send + Sync {
  /// Store a record, evicting whatever the limits require.
  fn save(&self, record: &PersistedRecord) -> Result<(), StoreError>;

  fn load(&self, key: &str) -> Result<Option<PersistedRecord>, StoreError>;

  fn remove(&self, key: &str) -> Result<(), StoreError>;

  fn clear(&self) -> Result<(), StoreError>;

  /// Metadata of every stored record.
  fn keys(&self) -> Result<Vec<RecordMeta>, StoreError>;

  fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl DurableStore for NoopStorage {
  fn save(&self, _record: &PersistedRecord) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn load(&self, _key: &str) -> Result<Option<PersistedRecord>, StoreError> {
    Ok(None) // Always miss
  }

  fn remove(&self, _key: &str) -> Result<(), StoreError> {
    Ok(())
  }

  fn clear(&self) -> Result<(), StoreError> {
    Ok(())
  }

  fn keys(&self) -> Result<Vec<RecordMeta>, StoreError> {
    Ok(Vec::new())
  }

  fn stats(&self) -> Result<StoreStats, StoreError> {
    Ok(StoreStats::default())
  }
}

/// Process-local store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
  records: Mutex<HashMap<String, PersistedRecord>>,
  limits: StoreLimits,
}

impl MemoryStorage {
  pub fn new(limits: StoreLimits) -> Self {
    Self {
      records: Mutex::new(HashMap::new()),
      limits,
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, PersistedRecord>>, StoreError> {
    self.records.lock().map_err(|_| StoreError::Poisoned)
  }
}

impl DurableStore for MemoryStorage {
  fn save(&self, record: &PersistedRecord) -> Result<(), StoreError> {
    let mut records = self.lock()?;
    let existing: Vec<RecordMeta> = records.values().map(PersistedRecord::meta).collect();
    let victims = plan_eviction(
      &existing,
      &record.key,
      record.size(),
      &self.limits,
      Utc::now(),
    )?;
    for victim in victims {
      debug!(key = %victim, "Evicting persisted collection");
      records.remove(&victim);
    }
    records.insert(record.key.clone(), record.clone());
    Ok(())
  }

  fn load(&self, key: &str) -> Result<Option<PersistedRecord>, StoreError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn clear(&self) -> Result<(), StoreError> {
    self.lock()?.clear();
    Ok(())
  }

  fn keys(&self) -> Result<Vec<RecordMeta>, StoreError> {
    Ok(self.lock()?.values().map(PersistedRecord::meta).collect())
  }

  fn stats(&self) -> Result<StoreStats, StoreError> {
    let records = self.lock()?;
    Ok(StoreStats {
      total_keys: records.len(),
      total_bytes: records.values().map(PersistedRecord::size).sum(),
    })
  }
}

/// SQLite-based durable store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  limits: StoreLimits,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path, limits: StoreLimits) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn, limits)
  }

  /// Open the store at the default location.
  pub fn open_default(limits: StoreLimits) -> Result<Self> {
    Self::open(&Self::default_path()?, limits)
  }

  pub fn open_in_memory(limits: StoreLimits) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn, limits)
  }

  fn with_connection(conn: Connection, limits: StoreLimits) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      limits,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tillcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::Poisoned)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cached collection (serialized JSON array)
CREATE TABLE IF NOT EXISTS collection_cache (
    cache_key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    saved_at TEXT NOT NULL,
    version INTEGER NOT NULL,
    item_count INTEGER NOT NULL,
    checksum TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_collection_cache_saved
    ON collection_cache(saved_at);
"#;

fn list_meta(conn: &Connection) -> Result<Vec<RecordMeta>, StoreError> {
  let mut stmt = conn.prepare(
    "SELECT cache_key, saved_at, length(data), item_count, version FROM collection_cache",
  )?;
  let rows = stmt.query_map([], |row| {
    Ok((
      row.get::<_, String>(0)?,
      row.get::<_, String>(1)?,
      row.get::<_, i64>(2)?,
      row.get::<_, i64>(3)?,
      row.get::<_, u32>(4)?,
    ))
  })?;

  let mut metas = Vec::new();
  for row in rows {
    let (key, saved_at, bytes, item_count, version) = row?;
    metas.push(RecordMeta {
      key,
      saved_at: parse_datetime(&saved_at)?,
      bytes: bytes.max(0) as u64,
      item_count: item_count.max(0) as usize,
      version,
    });
  }
  Ok(metas)
}

/// SQLite reports a full disk or database as `SQLITE_FULL`.
fn map_write_error(err: rusqlite::Error, needed: u64, capacity: u64) -> StoreError {
  match &err {
    rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
      StoreError::QuotaExceeded { needed, capacity }
    }
    _ => StoreError::Sqlite(err),
  }
}

impl DurableStore for SqliteStorage {
  fn save(&self, record: &PersistedRecord) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let existing = list_meta(&conn)?;
    let victims = plan_eviction(
      &existing,
      &record.key,
      record.size(),
      &self.limits,
      Utc::now(),
    )?;

    let needed = record.size();
    let capacity = self.limits.max_bytes;
    let tx = conn
      .transaction()
      .map_err(|e| map_write_error(e, needed, capacity))?;

    for victim in &victims {
      debug!(key = %victim, "Evicting persisted collection");
      tx.execute(
        "DELETE FROM collection_cache WHERE cache_key = ?",
        params![victim],
      )?;
    }

    tx.execute(
      "INSERT OR REPLACE INTO collection_cache
         (cache_key, data, saved_at, version, item_count, checksum)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        record.key,
        record.data,
        record.saved_at.to_rfc3339(),
        record.version,
        record.item_count as i64,
        record.checksum
      ],
    )
    .map_err(|e| map_write_error(e, needed, capacity))?;

    tx.commit().map_err(|e| map_write_error(e, needed, capacity))?;
    Ok(())
  }

  fn load(&self, key: &str) -> Result<Option<PersistedRecord>, StoreError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT data, saved_at, version, item_count, checksum FROM collection_cache
         WHERE cache_key = ?",
        params![key],
        |row| {
          Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u32>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
          ))
        },
      )
      .optional()?;

    match row {
      Some((data, saved_at, version, item_count, checksum)) => Ok(Some(PersistedRecord {
        key: key.to_string(),
        data,
        saved_at: parse_datetime(&saved_at)?,
        version,
        item_count: item_count.max(0) as usize,
        checksum,
      })),
      None => Ok(None),
    }
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM collection_cache WHERE cache_key = ?",
      params![key],
    )?;
    Ok(())
  }

  fn clear(&self) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM collection_cache", [])?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<RecordMeta>, StoreError> {
    let conn = self.lock()?;
    list_meta(&conn)
  }

  fn stats(&self) -> Result<StoreStats, StoreError> {
    let conn = self.lock()?;
    let (count, bytes): (i64, i64) = conn.query_row(
      "SELECT COUNT(*), COALESCE(SUM(length(data)), 0) FROM collection_cache",
      [],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(StoreStats {
      total_keys: count.max(0) as usize,
      total_bytes: bytes.max(0) as u64,
    })
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| StoreError::Timestamp(s.to_string()))
}
