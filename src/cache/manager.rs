//! Read-through cache manager: registry, durable store and retry policy
//! behind one `smart_fetch` call.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::freshness::{age_of, Freshness, FreshnessPolicy, PolicySet};
use super::registry::{CacheEntry, CacheStatus, Commit, ErasedData, Registry, SharedFetch};
use super::storage::{DurableStore, PersistedRecord, StoreStats, RECORD_VERSION};
use super::topics::{self, Subscription, Topics};
use super::traits::{CacheKey, Cacheable};
use super::writer::{StoreWriter, WriteReport};
use crate::errlog::{ErrorLog, Site};
use crate::error::FetchError;
use crate::event::{CacheEvent, EventBus};
use crate::network::NetworkMonitor;
use crate::retry::RetryPolicy;

const FETCH_SITE: Site = Site::new("manager", "smart_fetch", "fetch");
const SEED_SITE: Site = Site::new("manager", "seed", "load");
const ENCODE_SITE: Site = Site::new("manager", "commit", "encode");

/// Knobs for a [`SmartCache`].
#[derive(Clone)]
pub struct CacheSettings {
  pub policies: PolicySet,
  pub retry: RetryPolicy,
  pub network: NetworkMonitor,
  /// Hard ceiling for one fetch including all retries
  pub fetch_timeout: StdDuration,
  pub error_log: Arc<ErrorLog>,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      policies: PolicySet::default(),
      retry: RetryPolicy::default(),
      network: NetworkMonitor::new(),
      fetch_timeout: StdDuration::from_secs(120),
      error_log: Arc::new(ErrorLog::default()),
    }
  }
}

/// Per-call options for [`SmartCache::smart_fetch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
  /// Overrides the collection's configured freshness windows
  pub policy: Option<FreshnessPolicy>,
  /// Skip every cached tier and supersede any fetch in flight
  pub force_refresh: bool,
}

impl FetchOptions {
  pub fn force() -> Self {
    Self {
      force_refresh: true,
      ..Self::default()
    }
  }

  pub fn with_policy(policy: FreshnessPolicy) -> Self {
    Self {
      policy: Some(policy),
      ..Self::default()
    }
  }
}

/// Diagnostics for one key.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
  pub item_count: usize,
  pub is_fresh: bool,
  pub is_stale: bool,
  pub is_expired: bool,
  #[serde(skip)]
  pub age: Option<Duration>,
  pub last_synced: Option<DateTime<Utc>>,
  pub status: CacheStatus,
  /// Held in memory by this process
  pub resident: bool,
  pub memory_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
  pub keys: BTreeMap<String, KeyStats>,
  pub store: StoreStats,
}

enum Plan {
  Ready(ErasedData),
  Await {
    future: SharedFetch,
    fallback: Option<ErasedData>,
  },
}

struct Inner {
  registry: Mutex<Registry>,
  topics: Arc<Mutex<Topics>>,
  store: Arc<dyn DurableStore>,
  writer: StoreWriter,
  settings: CacheSettings,
}

/// Stale-while-revalidate cache for named collections.
///
/// Clones share the same registry. Construct inside a tokio runtime: the
/// durable store writer and every fetch run as spawned tasks.
#[derive(Clone)]
pub struct SmartCache {
  inner: Arc<Inner>,
}

impl SmartCache {
  pub fn new(store: Arc<dyn DurableStore>) -> Self {
    Self::with_settings(store, CacheSettings::default())
  }

  pub fn with_settings(store: Arc<dyn DurableStore>, mut settings: CacheSettings) -> Self {
    settings.retry = settings.retry.with_network(settings.network.clone());
    let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
      let weak = weak.clone();
      let writer = StoreWriter::spawn(store.clone(), move |report| {
        if let Some(inner) = weak.upgrade() {
          inner.on_write(report);
        }
      });
      Inner {
        registry: Mutex::new(Registry::new()),
        topics: Arc::new(Mutex::new(Topics::default())),
        store,
        writer,
        settings,
      }
    });
    Self { inner }
  }

  pub fn network(&self) -> &NetworkMonitor {
    &self.inner.settings.network
  }

  pub fn error_log(&self) -> &Arc<ErrorLog> {
    &self.inner.settings.error_log
  }

  fn policy_for(&self, key: &CacheKey) -> FreshnessPolicy {
    self.inner.settings.policies.for_collection(key.collection())
  }

  /// Best currently-known data for `key`, fetching through `fetch_fn` when
  /// needed.
  ///
  /// Fresh data returns without suspending on the network. Stale data returns
  /// immediately and schedules a background refresh. Expired or invalidated
  /// data waits for the refresh and falls back to the old data if it fails.
  /// With nothing cached the call waits for the fetch; concurrent callers
  /// share one fetch.
  pub async fn smart_fetch<T, F, Fut>(
    &self,
    key: impl Into<CacheKey>,
    fetch_fn: F,
    options: FetchOptions,
  ) -> Result<Arc<Vec<T>>, FetchError>
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
  {
    let key = key.into();
    if !self.inner.lock_registry().contains(key.as_str()) {
      self.seed::<T>(&key).await;
    }

    let policy = options.policy.unwrap_or_else(|| self.policy_for(&key));
    match self.plan::<T, F, Fut>(&key, policy, options.force_refresh, fetch_fn) {
      Plan::Ready(data) => downcast(&key, data),
      Plan::Await { future, fallback } => match future.await {
        Ok(data) => downcast(&key, data),
        Err(err) => match fallback {
          Some(data) => {
            debug!(key = %key, error = %err, "Refresh failed, serving last-known data");
            downcast(&key, data)
          }
          None => Err(err),
        },
      },
    }
  }

  /// Decide how to serve one read, launching a fetch if one is needed. Runs
  /// entirely under the registry lock so two callers can never both launch.
  fn plan<T, F, Fut>(
    &self,
    key: &CacheKey,
    policy: FreshnessPolicy,
    force: bool,
    fetch_fn: F,
  ) -> Plan
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
  {
    let online = self.inner.settings.network.is_online();
    let mut registry = self.inner.lock_registry();
    let (freshness, data, attached) = {
      let entry = registry.entry(key);
      let freshness = entry.age_out(&policy, Utc::now());
      let attached = entry.in_flight.as_ref().map(|f| f.future.clone());
      (freshness, entry.data.clone(), attached)
    };

    if force {
      if let Some(data) = data.as_ref().filter(|_| !online) {
        debug!(key = %key, "Offline, serving cached data instead of forced refresh");
        return Plan::Ready(data.clone());
      }
      let future = self.launch::<T, F, Fut>(&mut registry, key, fetch_fn);
      return Plan::Await {
        future,
        fallback: data,
      };
    }

    match (data, freshness) {
      (Some(data), Freshness::Fresh) => Plan::Ready(data),
      (Some(data), _) if !online => {
        debug!(key = %key, "Offline, serving cached data");
        Plan::Ready(data)
      }
      (Some(data), Freshness::Stale) => {
        if attached.is_none() {
          debug!(key = %key, "Serving stale data, refreshing in background");
          let _ = self.launch::<T, F, Fut>(&mut registry, key, fetch_fn);
        }
        Plan::Ready(data)
      }
      (fallback, _) => {
        let future = match attached {
          Some(future) => {
            debug!(key = %key, "Attaching to in-flight fetch");
            future
          }
          None => self.launch::<T, F, Fut>(&mut registry, key, fetch_fn),
        };
        Plan::Await { future, fallback }
      }
    }
  }

  /// Spawn a fetch for `key` and register it as the entry's in-flight fetch.
  ///
  /// The fetch runs as its own task so it finishes and commits even when no
  /// caller is left waiting for it.
  fn launch<T, F, Fut>(&self, registry: &mut Registry, key: &CacheKey, fetch_fn: F) -> SharedFetch
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
  {
    let seq = registry.allocate_seq();
    let epoch = registry.epoch();
    let inner = Arc::clone(&self.inner);
    let task_key = key.clone();

    let handle: JoinHandle<_> = tokio::spawn(async move {
      let ceiling = inner.settings.fetch_timeout;
      let result = match tokio::time::timeout(ceiling, inner.settings.retry.run(&fetch_fn)).await {
        Ok(result) => result,
        Err(_) => {
          warn!(key = %task_key, timeout_secs = ceiling.as_secs(), "Fetch exceeded hard ceiling");
          Err(FetchError::Timeout(ceiling))
        }
      };
      inner.commit::<T>(&task_key, seq, epoch, result)
    });

    let future = async move {
      match handle.await {
        Ok(outcome) => outcome,
        Err(e) => Err(FetchError::fatal(format!("Fetch task failed: {}", e))),
      }
    }
    .boxed()
    .shared();

    debug!(key = %key, seq, "Launching fetch");
    registry.entry(key).begin_fetch(seq, future.clone());
    future
  }

  /// Seed the registry from the durable store the first time a key is
  /// touched in this process.
  async fn seed<T: Cacheable>(&self, key: &CacheKey) {
    self.inner.writer.flush().await;

    let record = match self.inner.store.load(key.as_str()) {
      Ok(Some(record)) => record,
      Ok(None) => return,
      Err(err) => {
        let online = self.inner.settings.network.is_online();
        self
          .inner
          .settings
          .error_log
          .record_store(SEED_SITE, Some(key.as_str()), &err, online);
        return;
      }
    };

    if record.version != RECORD_VERSION {
      debug!(key = %key, version = record.version, "Discarding persisted record with old format");
      self.inner.writer.remove(key.as_str());
      return;
    }

    let items = match record.decode::<T>() {
      Ok(items) => items,
      Err(err) => {
        warn!(key = %key, error = %err, "Discarding unreadable persisted record");
        self.inner.writer.remove(key.as_str());
        return;
      }
    };

    let entry = CacheEntry::seeded(
      key.clone(),
      Arc::new(items),
      record.item_count,
      record.saved_at,
      record.checksum,
    );
    if self.inner.lock_registry().seed(entry) {
      debug!(key = %key, saved_at = %record.saved_at, "Seeded from durable store");
    }
  }

  /// Call `callback` whenever `key` becomes fresh with new content.
  pub fn subscribe<T, C>(&self, key: impl Into<CacheKey>, callback: C) -> Subscription
  where
    T: Cacheable,
    C: Fn(Arc<Vec<T>>) + Send + Sync + 'static,
  {
    let key = key.into();
    let listener: topics::Listener = Arc::new(move |data: &ErasedData| {
      if let Ok(typed) = Arc::clone(data).downcast::<Vec<T>>() {
        callback(typed);
      }
    });
    let id = self
      .inner
      .topics
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .add(key.as_str(), listener);
    Subscription::new(key.as_str().to_string(), id, Arc::downgrade(&self.inner.topics))
  }

  pub fn subscriber_count(&self, key: impl Into<CacheKey>) -> usize {
    let key = key.into();
    self
      .inner
      .topics
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .count(key.as_str())
  }

  /// Make the next read of `key` refresh. Cached data stays visible until
  /// the replacement arrives; the persisted copy is dropped.
  pub fn invalidate_cache(&self, key: impl Into<CacheKey>) {
    let key = key.into();
    {
      // Queue the removal under the lock so a concurrent commit cannot
      // re-persist the key after it
      let mut registry = self.inner.lock_registry();
      if let Some(entry) = registry.get_mut(key.as_str()) {
        entry.invalidate();
      }
      self.inner.writer.remove(key.as_str());
    }
    info!(key = %key, "Cache invalidated");
  }

  /// Invalidate every resident key matching `predicate`.
  pub fn invalidate_where<P>(&self, predicate: P) -> usize
  where
    P: Fn(&CacheKey) -> bool,
  {
    let keys: Vec<String> = {
      let mut registry = self.inner.lock_registry();
      let keys: Vec<String> = registry
        .entries_mut()
        .filter(|entry| predicate(&entry.key))
        .map(|entry| {
          entry.invalidate();
          entry.key.as_str().to_string()
        })
        .collect();
      for key in &keys {
        self.inner.writer.remove(key.as_str());
      }
      keys
    };
    if !keys.is_empty() {
      info!(count = keys.len(), "Cache keys invalidated");
    }
    keys.len()
  }

  /// Drop every entry and the durable store. Fetches started before the
  /// clear finish but their results are discarded. Subscriptions stay valid.
  pub fn clear_all_cache(&self) {
    {
      let mut registry = self.inner.lock_registry();
      registry.clear();
      self.inner.writer.clear();
    }
    info!("All cached data cleared");
  }

  /// Wait until queued durable writes are applied.
  pub async fn flush(&self) {
    self.inner.writer.flush().await;
  }

  /// Current status of `key`; `Empty` when nothing is held.
  pub fn status(&self, key: impl Into<CacheKey>) -> CacheStatus {
    let key = key.into();
    self
      .inner
      .lock_registry()
      .get(key.as_str())
      .map_or(CacheStatus::Empty, |entry| entry.status)
  }

  pub fn last_error(&self, key: impl Into<CacheKey>) -> Option<FetchError> {
    let key = key.into();
    self
      .inner
      .lock_registry()
      .get(key.as_str())
      .and_then(|entry| entry.error.clone())
  }

  /// Data held in memory for `key`, without touching store or network.
  pub fn peek<T: Cacheable>(&self, key: impl Into<CacheKey>) -> Option<Arc<Vec<T>>> {
    let key = key.into();
    let data = self
      .inner
      .lock_registry()
      .get(key.as_str())
      .and_then(|entry| entry.data.clone())?;
    data.downcast::<Vec<T>>().ok()
  }

  /// Data for `key` from memory or the durable store, without a fetch.
  pub async fn cached<T: Cacheable>(&self, key: impl Into<CacheKey>) -> Option<Arc<Vec<T>>> {
    let key = key.into();
    if !self.inner.lock_registry().contains(key.as_str()) {
      self.seed::<T>(&key).await;
    }
    self.peek(&key)
  }

  /// Per-key freshness for resident and persisted keys, plus store totals.
  pub async fn get_cache_stats(&self) -> CacheStats {
    self.inner.writer.flush().await;
    let now = Utc::now();
    let policies = &self.inner.settings.policies;
    let mut keys = BTreeMap::new();

    {
      let registry = self.inner.lock_registry();
      for entry in registry.entries() {
        let policy = policies.for_collection(entry.key.collection());
        keys.insert(
          entry.key.as_str().to_string(),
          key_stats(
            &policy,
            now,
            entry.item_count,
            entry.fetched_at,
            entry.status,
            true,
            entry.memory_only,
          ),
        );
      }
    }

    match self.inner.store.keys() {
      Ok(metas) => {
        for meta in metas {
          let policy = policies.for_key(&meta.key);
          keys.entry(meta.key.clone()).or_insert_with(|| {
            key_stats(
              &policy,
              now,
              meta.item_count,
              Some(meta.saved_at),
              CacheStatus::Empty,
              false,
              false,
            )
          });
        }
      }
      Err(err) => warn!(error = %err, "Failed to list persisted collections"),
    }

    let store = self.inner.store.stats().unwrap_or_else(|err| {
      warn!(error = %err, "Failed to read durable store stats");
      StoreStats::default()
    });

    CacheStats { keys, store }
  }

  /// Follow context events from the bus: a branch switch invalidates
  /// partitioned keys, logout clears everything, a data sync invalidates the
  /// named key (or all keys).
  pub fn attach(&self, bus: &EventBus) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);
    let mut events = bus.subscribe();
    tokio::spawn(async move {
      while let Some(event) = events.next().await {
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let cache = SmartCache { inner };
        match event {
          CacheEvent::BranchSwitched { branch_id } => {
            let count = cache.invalidate_where(CacheKey::is_branch_scoped);
            info!(branch = %branch_id, count, "Branch switched, invalidated partitioned keys");
          }
          CacheEvent::LoggedOut => cache.clear_all_cache(),
          CacheEvent::DataSynced { key: Some(key) } => cache.invalidate_cache(key),
          CacheEvent::DataSynced { key: None } => {
            cache.invalidate_where(|_| true);
          }
          _ => {}
        }
      }
    })
  }
}

fn key_stats(
  policy: &FreshnessPolicy,
  now: DateTime<Utc>,
  item_count: usize,
  fetched_at: Option<DateTime<Utc>>,
  status: CacheStatus,
  resident: bool,
  memory_only: bool,
) -> KeyStats {
  let freshness = policy.classify(fetched_at, now);
  KeyStats {
    item_count,
    is_fresh: freshness == Freshness::Fresh,
    is_stale: freshness == Freshness::Stale,
    is_expired: freshness == Freshness::Expired,
    age: fetched_at.map(|at| age_of(at, now)),
    last_synced: fetched_at,
    status,
    resident,
    memory_only,
  }
}

fn downcast<T: Cacheable>(key: &CacheKey, data: ErasedData) -> Result<Arc<Vec<T>>, FetchError> {
  data.downcast::<Vec<T>>().map_err(|_| {
    FetchError::fatal(format!(
      "Cached data for '{}' is not a collection of {}",
      key,
      T::collection()
    ))
  })
}

impl Inner {
  fn lock_registry(&self) -> MutexGuard<'_, Registry> {
    self
      .registry
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Apply a finished fetch. Subscribers are notified after the registry
  /// lock is released.
  fn commit<T: Cacheable>(
    &self,
    key: &CacheKey,
    seq: u64,
    epoch: u64,
    result: Result<Vec<T>, FetchError>,
  ) -> Result<ErasedData, FetchError> {
    let online = self.settings.network.is_online();
    let items = match result {
      Ok(items) => items,
      Err(err) => {
        self
          .settings
          .error_log
          .record_fetch(FETCH_SITE, key.as_str(), &err, online);
        let mut registry = self.lock_registry();
        if registry.epoch() == epoch {
          if let Some(entry) = registry.get_mut(key.as_str()) {
            entry.fail(seq, err.clone());
          }
        }
        return Err(err);
      }
    };

    let now = Utc::now();
    let record = match PersistedRecord::encode(key.as_str(), &items, now) {
      Ok(record) => Some(record),
      Err(err) => {
        self
          .settings
          .error_log
          .record_store(ENCODE_SITE, Some(key.as_str()), &err, online);
        None
      }
    };
    let checksum = record.as_ref().map(|r| r.checksum.clone());
    let item_count = items.len();
    let data: ErasedData = Arc::new(items);

    let commit = {
      let mut registry = self.lock_registry();
      if registry.epoch() != epoch {
        debug!(key = %key, "Discarding result of fetch started before cache clear");
        return Ok(data);
      }
      let commit = match registry.get_mut(key.as_str()) {
        Some(entry) => entry.complete(seq, data.clone(), item_count, now, checksum),
        None => return Ok(data),
      };
      // Queued under the same lock as clear and invalidate, so the store
      // sees writes in registry order
      if let (Commit::Applied { .. }, Some(record)) = (&commit, record) {
        self.writer.save(record);
      }
      commit
    };

    match commit {
      Commit::Superseded { latest } => {
        debug!(key = %key, seq, "Ignoring result older than committed data");
        Ok(latest.unwrap_or(data))
      }
      Commit::Applied { changed } => {
        debug!(key = %key, seq, item_count, changed, "Committed fetch result");
        if changed {
          topics::publish(&self.topics, key.as_str(), &data);
        }
        Ok(data)
      }
    }
  }

  fn on_write(&self, report: WriteReport) {
    let WriteReport { op, key, result } = report;
    match result {
      Ok(()) => {
        if let (Some(key), "save") = (&key, op) {
          if let Some(entry) = self.lock_registry().get_mut(key) {
            entry.memory_only = false;
          }
        }
      }
      Err(err) => {
        let online = self.settings.network.is_online();
        if err.is_quota() {
          warn!(
            key = ?key,
            error = %err,
            "Durable store is full, keeping collection in memory only"
          );
          if let Some(key) = &key {
            if let Some(entry) = self.lock_registry().get_mut(key) {
              entry.memory_only = true;
            }
          }
        } else {
          warn!(op, key = ?key, error = %err, "Durable store write failed");
        }
        self.settings.error_log.record_store(
          Site::new("store", "writer", op),
          key.as_deref(),
          &err,
          online,
        );
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{MemoryStorage, SqliteStorage, StoreLimits};
  use crate::errlog::{ErrorType, LogFilter};
  use futures::future::BoxFuture;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::{mpsc, oneshot};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Item {
    id: u32,
  }

  impl Cacheable for Item {
    fn cache_key(&self) -> String {
      self.id.to_string()
    }

    fn collection() -> &'static str {
      "items"
    }
  }

  fn items(ids: &[u32]) -> Vec<Item> {
    ids.iter().map(|&id| Item { id }).collect()
  }

  fn ids(data: &[Item]) -> Vec<u32> {
    data.iter().map(|item| item.id).collect()
  }

  /// Fetch function that counts calls and returns `ids` after `delay`.
  fn counted(
    calls: &Arc<AtomicUsize>,
    ids: &'static [u32],
    delay: StdDuration,
  ) -> impl Fn() -> BoxFuture<'static, Result<Vec<Item>, FetchError>> + Send + Sync + 'static {
    let calls = calls.clone();
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(delay).await;
        Ok(items(ids))
      }
      .boxed()
    }
  }

  /// Fetch function that resolves with whatever is sent through the gate.
  fn gated(
    gate: oneshot::Receiver<Vec<Item>>,
  ) -> impl Fn() -> BoxFuture<'static, Result<Vec<Item>, FetchError>> + Send + Sync + 'static {
    let slot = Arc::new(Mutex::new(Some(gate)));
    move || {
      let gate = slot.lock().unwrap().take();
      async move {
        match gate {
          Some(gate) => gate.await.map_err(|_| FetchError::fatal("gate dropped")),
          None => Err(FetchError::fatal("gate used twice")),
        }
      }
      .boxed()
    }
  }

  fn memory_cache() -> (SmartCache, Arc<MemoryStorage>) {
    let store = Arc::new(MemoryStorage::default());
    (SmartCache::new(store.clone()), store)
  }

  fn fast_retry(attempts: u32) -> CacheSettings {
    CacheSettings {
      retry: RetryPolicy::new(attempts, StdDuration::from_millis(10)),
      ..CacheSettings::default()
    }
  }

  async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }

  #[tokio::test]
  async fn test_concurrent_calls_share_one_fetch() {
    let (cache, _) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let reads = (0..10).map(|_| {
      cache.smart_fetch(
        "products",
        counted(&calls, &[1, 2], StdDuration::from_millis(20)),
        FetchOptions::default(),
      )
    });
    let results = futures::future::join_all(reads).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
      assert_eq!(ids(&result.unwrap()), vec![1, 2]);
    }
  }

  #[tokio::test]
  async fn test_stale_data_returns_immediately_and_refreshes() {
    let (cache, _) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    cache
      .smart_fetch("products", counted(&calls, &[1], StdDuration::ZERO), FetchOptions::default())
      .await
      .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = cache.subscribe("products", move |data: Arc<Vec<Item>>| {
      let _ = tx.send(ids(&data));
    });

    let always_stale = FreshnessPolicy::new(Duration::zero(), Duration::hours(24));
    let immediate = cache
      .smart_fetch(
        "products",
        counted(&calls, &[1, 2], StdDuration::from_millis(5)),
        FetchOptions::with_policy(always_stale),
      )
      .now_or_never()
      .expect("stale data must not wait for the network")
      .unwrap();
    assert_eq!(ids(&immediate), vec![1]);

    let pushed = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
      .await
      .expect("subscriber notified")
      .expect("channel open");
    assert_eq!(pushed, vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.status("products"), CacheStatus::Fresh);
  }

  #[tokio::test]
  async fn test_older_fetch_cannot_overwrite_newer() {
    let (cache, _) = memory_cache();
    let (send_a, gate_a) = oneshot::channel();
    let (send_b, gate_b) = oneshot::channel();

    let first = {
      let cache = cache.clone();
      tokio::spawn(async move {
        cache
          .smart_fetch("products", gated(gate_a), FetchOptions::default())
          .await
      })
    };
    settle().await;
    let second = {
      let cache = cache.clone();
      tokio::spawn(async move {
        cache
          .smart_fetch("products", gated(gate_b), FetchOptions::force())
          .await
      })
    };
    settle().await;

    send_b.send(items(&[2])).unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(ids(&b), vec![2]);
    assert_eq!(cache.status("products"), CacheStatus::Fresh);

    send_a.send(items(&[1])).unwrap();
    let a = first.await.unwrap().unwrap();
    assert_eq!(ids(&a), vec![2]);
    assert_eq!(ids(&cache.peek::<Item>("products").unwrap()), vec![2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_are_retried() {
    let cache = SmartCache::with_settings(Arc::new(MemoryStorage::default()), fast_retry(3));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let data = cache
      .smart_fetch(
        "products",
        move || {
          let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
          async move {
            if attempt < 3 {
              Err(FetchError::from_status(503, "Service Unavailable"))
            } else {
              Ok(items(&[1, 2]))
            }
          }
        },
        FetchOptions::default(),
      )
      .await
      .unwrap();

    assert_eq!(ids(&data), vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_fatal_error_is_called_once() {
    let cache = SmartCache::with_settings(Arc::new(MemoryStorage::default()), fast_retry(5));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let err = cache
      .smart_fetch(
        "products",
        move || {
          counter.fetch_add(1, Ordering::SeqCst);
          async { Err::<Vec<Item>, _>(FetchError::from_status(401, "JWT expired")) }
        },
        FetchOptions::default(),
      )
      .await
      .unwrap_err();

    assert_eq!(err.status(), Some(401));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.status("products"), CacheStatus::Error);
    assert_eq!(cache.last_error("products"), Some(err));
    let logged = cache.error_log().recent(&LogFilter::default());
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].key.as_deref(), Some("products"));
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let (cache, _) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = || counted(&calls, &[1], StdDuration::ZERO);

    cache.smart_fetch("products", fetch(), FetchOptions::default()).await.unwrap();
    cache.smart_fetch("products", fetch(), FetchOptions::default()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache.invalidate_cache("products");
    assert_eq!(cache.status("products"), CacheStatus::Stale);
    assert_eq!(ids(&cache.peek::<Item>("products").unwrap()), vec![1]);

    cache.smart_fetch("products", fetch(), FetchOptions::default()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.status("products"), CacheStatus::Fresh);
  }

  #[tokio::test]
  async fn test_branch_keys_are_isolated() {
    let (cache, _) = memory_cache();
    let calls_a = Arc::new(AtomicUsize::new(0));
    let calls_b = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
      cache.smart_fetch(
        CacheKey::partitioned("customers", "A"),
        counted(&calls_a, &[10], StdDuration::from_millis(5)),
        FetchOptions::default(),
      ),
      cache.smart_fetch(
        CacheKey::partitioned("customers", "B"),
        counted(&calls_b, &[20], StdDuration::from_millis(5)),
        FetchOptions::default(),
      ),
    );

    assert_eq!(ids(&a.unwrap()), vec![10]);
    assert_eq!(ids(&b.unwrap()), vec![20]);
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    assert_eq!(ids(&cache.peek::<Item>("customers_A").unwrap()), vec![10]);
  }

  #[tokio::test]
  async fn test_durable_round_trip_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let calls = Arc::new(AtomicUsize::new(0));

    {
      let store = Arc::new(SqliteStorage::open(&path, StoreLimits::default()).unwrap());
      let cache = SmartCache::new(store);
      let fetcher = counted(&calls, &[1, 2], StdDuration::ZERO);
      cache
        .smart_fetch("products", fetcher, FetchOptions::default())
        .await
        .unwrap();
      cache.flush().await;
    }

    let store = Arc::new(SqliteStorage::open(&path, StoreLimits::default()).unwrap());
    let reloaded = SmartCache::new(store);
    let data = reloaded
      .smart_fetch("products", counted(&calls, &[9], StdDuration::ZERO), FetchOptions::default())
      .await
      .unwrap();

    assert_eq!(ids(&data), vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = reloaded.get_cache_stats().await;
    let products = &stats.keys["products"];
    assert!(products.is_fresh);
    assert_eq!(products.item_count, 2);
    assert!(products.last_synced.is_some());
    assert!(products.age.unwrap() < Duration::minutes(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cold_start_scenario() {
    let (cache, store) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    assert_eq!(cache.status("products"), CacheStatus::Empty);

    let pending = {
      let cache = cache.clone();
      let fetch = counted(&calls, &[1, 2], StdDuration::from_millis(50));
      tokio::spawn(async move {
        cache
          .smart_fetch("products", fetch, FetchOptions::default())
          .await
      })
    };
    settle().await;
    assert_eq!(cache.status("products"), CacheStatus::Loading);

    let data = pending.await.unwrap().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(cache.status("products"), CacheStatus::Fresh);

    cache.flush().await;
    let record = store.load("products").unwrap().expect("persisted");
    assert_eq!(record.decode::<Item>().unwrap(), items(&[1, 2]));
  }

  #[tokio::test]
  async fn test_fresh_hit_skips_fetch() {
    let store = Arc::new(MemoryStorage::default());
    let ten_minutes_ago = Utc::now() - Duration::minutes(10);
    store
      .save(&PersistedRecord::encode("products", &items(&[1, 2]), ten_minutes_ago).unwrap())
      .unwrap();

    let cache = SmartCache::new(store);
    let calls = Arc::new(AtomicUsize::new(0));
    let data = cache
      .smart_fetch("products", counted(&calls, &[3], StdDuration::ZERO), FetchOptions::default())
      .await
      .unwrap();

    assert_eq!(ids(&data), vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(cache.status("products"), CacheStatus::Fresh);
  }

  #[tokio::test]
  async fn test_expired_data_waits_and_falls_back() {
    let store = Arc::new(MemoryStorage::default());
    let two_days_ago = Utc::now() - Duration::days(2);
    store
      .save(&PersistedRecord::encode("products", &items(&[1]), two_days_ago).unwrap())
      .unwrap();
    let cache = SmartCache::with_settings(store, fast_retry(1));

    let data = cache
      .smart_fetch(
        "products",
        || async { Err::<Vec<Item>, _>(FetchError::from_status(500, "boom")) },
        FetchOptions::default(),
      )
      .await
      .unwrap();

    assert_eq!(ids(&data), vec![1]);
    assert_eq!(cache.status("products"), CacheStatus::Error);
  }

  #[tokio::test]
  async fn test_offline_serves_cached_data() {
    let (cache, _) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    cache
      .smart_fetch("products", counted(&calls, &[1], StdDuration::ZERO), FetchOptions::default())
      .await
      .unwrap();
    cache.invalidate_cache("products");
    cache.network().set_online(false);

    let data = cache
      .smart_fetch("products", counted(&calls, &[2], StdDuration::ZERO), FetchOptions::force())
      .await
      .unwrap();
    assert_eq!(ids(&data), vec![1]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let missing = cache
      .smart_fetch("customers_A", counted(&calls, &[2], StdDuration::ZERO), FetchOptions::default())
      .await;
    assert_eq!(missing.unwrap_err(), FetchError::NetworkUnavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_quota_falls_back_to_memory() {
    let store = Arc::new(MemoryStorage::new(StoreLimits {
      max_bytes: 8,
      ..StoreLimits::default()
    }));
    let cache = SmartCache::new(store.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let fetcher = counted(&calls, &[1, 2, 3], StdDuration::ZERO);
    let data = cache
      .smart_fetch("products", fetcher, FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(data.len(), 3);
    cache.flush().await;

    assert!(store.load("products").unwrap().is_none());
    let stats = cache.get_cache_stats().await;
    assert!(stats.keys["products"].memory_only);
    assert_eq!(cache.status("products"), CacheStatus::Fresh);

    let storage_errors = cache.error_log().recent(&LogFilter {
      error_type: Some(ErrorType::Storage),
      ..Default::default()
    });
    assert_eq!(storage_errors.len(), 1);
  }

  #[tokio::test]
  async fn test_disposed_subscription_is_not_called() {
    let (cache, _) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    let sub = cache.subscribe("products", move |_: Arc<Vec<Item>>| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(cache.subscriber_count("products"), 1);

    cache
      .smart_fetch("products", counted(&calls, &[1], StdDuration::ZERO), FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    sub.unsubscribe();
    assert_eq!(cache.subscriber_count("products"), 0);
    cache
      .smart_fetch("products", counted(&calls, &[2], StdDuration::ZERO), FetchOptions::force())
      .await
      .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_identical_refresh_does_not_notify() {
    let (cache, _) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let _sub = cache.subscribe("products", move |_: Arc<Vec<Item>>| {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..2 {
      cache
        .smart_fetch("products", counted(&calls, &[1], StdDuration::ZERO), FetchOptions::force())
        .await
        .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_clear_all_discards_late_results() {
    let (cache, store) = memory_cache();
    let (release, gate) = oneshot::channel();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let _sub = cache.subscribe("products", move |_: Arc<Vec<Item>>| {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    let pending = {
      let cache = cache.clone();
      tokio::spawn(async move {
        cache
          .smart_fetch("products", gated(gate), FetchOptions::default())
          .await
      })
    };
    settle().await;

    cache.clear_all_cache();
    release.send(items(&[1])).unwrap();
    let returned = pending.await.unwrap().unwrap();
    assert_eq!(ids(&returned), vec![1]);

    assert_eq!(cache.status("products"), CacheStatus::Empty);
    assert!(cache.peek::<Item>("products").is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    cache.flush().await;
    assert_eq!(store.stats().unwrap().total_keys, 0);

    // Subscribers survive the clear and hear about the next load
    let calls = Arc::new(AtomicUsize::new(0));
    cache
      .smart_fetch("products", counted(&calls, &[2], StdDuration::ZERO), FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_bus_events_drive_invalidation() {
    let (cache, _) = memory_cache();
    let bus = EventBus::default();
    let _listener = cache.attach(&bus);
    let calls = Arc::new(AtomicUsize::new(0));

    let keys = [
      CacheKey::branch("customers", "A"),
      CacheKey::new("payment_methods"),
      CacheKey::partitioned("variant_children", "p1"),
    ];
    for key in &keys {
      cache
        .smart_fetch(key, counted(&calls, &[1], StdDuration::ZERO), FetchOptions::default())
        .await
        .unwrap();
    }

    bus.publish(CacheEvent::BranchSwitched {
      branch_id: "B".to_string(),
    });
    settle().await;
    assert_eq!(cache.status("customers_A"), CacheStatus::Stale);
    assert_eq!(cache.status("payment_methods"), CacheStatus::Fresh);
    // Partitioned by parent variant, not by branch
    assert_eq!(cache.status("variant_children_p1"), CacheStatus::Fresh);

    bus.publish(CacheEvent::LoggedOut);
    settle().await;
    assert_eq!(cache.status("payment_methods"), CacheStatus::Empty);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_fetch_hits_ceiling() {
    let (cache, _) = memory_cache();

    let err = cache
      .smart_fetch(
        "products",
        || futures::future::pending::<Result<Vec<Item>, FetchError>>(),
        FetchOptions::default(),
      )
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::Timeout(StdDuration::from_secs(120)));
    assert_eq!(cache.status("products"), CacheStatus::Error);

    // The key is not stuck behind the hung fetch
    let calls = Arc::new(AtomicUsize::new(0));
    let data = cache
      .smart_fetch("products", counted(&calls, &[1], StdDuration::ZERO), FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(ids(&data), vec![1]);
    assert_eq!(cache.status("products"), CacheStatus::Fresh);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_clear_right_after_commit_leaves_store_empty() {
    let (cache, store) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..200 {
      let fetch = {
        let cache = cache.clone();
        let fetch = counted(&calls, &[1, 2], StdDuration::ZERO);
        tokio::spawn(async move {
          cache
            .smart_fetch("products", fetch, FetchOptions::default())
            .await
        })
      };
      while cache.status("products") != CacheStatus::Fresh {
        tokio::task::yield_now().await;
      }
      cache.clear_all_cache();
      fetch.await.unwrap().unwrap();
      cache.flush().await;
      assert!(store.load("products").unwrap().is_none());
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_invalidate_right_after_commit_drops_persisted_copy() {
    let (cache, store) = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..200 {
      let fetch = {
        let cache = cache.clone();
        let fetch = counted(&calls, &[1], StdDuration::ZERO);
        tokio::spawn(async move {
          cache
            .smart_fetch("products", fetch, FetchOptions::force())
            .await
        })
      };
      while cache.status("products") != CacheStatus::Fresh {
        tokio::task::yield_now().await;
      }
      cache.invalidate_cache("products");
      fetch.await.unwrap().unwrap();
      cache.flush().await;
      assert!(store.load("products").unwrap().is_none());
    }
  }
}
