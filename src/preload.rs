//! Cache warming after login, on branch switch, on a timer and when the app
//! returns to the foreground.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, Cacheable, FetchOptions};
use crate::catalog::{Catalog, Collection};
use crate::datastore::DataStore;
use crate::error::FetchError;
use crate::event::{CacheEvent, EventBus};
use crate::models::{
  AttendanceRecord, Branch, Category, Customer, Employee, PaymentMethod, Product, ProductVariant,
  Supplier,
};
use crate::source::CollectionSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadState {
  Idle,
  Preloading,
  Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadMode {
  /// Serve whatever the cache holds, fetch only what is missing
  #[default]
  Initial,
  /// Fetch everything again
  Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadSettings {
  /// Pause before the first fetch of an initial run, to stay out of the way
  /// of first paint
  pub initial_delay: Duration,
  pub refresh_interval: Duration,
  /// Foreground events closer than this to the last load are ignored
  pub foreground_min_interval: Duration,
}

impl Default for PreloadSettings {
  fn default() -> Self {
    Self {
      initial_delay: Duration::from_millis(250),
      refresh_interval: Duration::from_secs(20 * 60),
      foreground_min_interval: Duration::from_secs(5 * 60),
    }
  }
}

/// How far the current run has got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PreloadProgress {
  pub completed: usize,
  pub total: usize,
}

impl PreloadProgress {
  pub fn percent(self) -> u8 {
    if self.total == 0 {
      return 0;
    }
    (self.completed.min(self.total) * 100 / self.total) as u8
  }
}

/// Outcome of one preload run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreloadReport {
  pub branch: Option<String>,
  pub mode: PreloadMode,
  pub loaded: Vec<String>,
  pub failed: Vec<String>,
  pub errors: BTreeMap<String, String>,
  /// Collections served from cache (a subset of `loaded`)
  pub from_cache: Vec<String>,
  pub duration: Duration,
  /// A branch switch or logout happened while this run was in progress
  pub superseded: bool,
}

impl PreloadReport {
  pub fn success(&self) -> bool {
    self.failed.is_empty() && !self.superseded
  }
}

enum Warmed {
  Cached,
  Fetched,
}

type SharedRun = Shared<BoxFuture<'static, Arc<PreloadReport>>>;

struct RunState {
  branch: Option<String>,
  /// Bumped on every reset; runs from older generations publish nothing
  generation: u64,
  running: Option<SharedRun>,
  last_loaded: Option<Instant>,
}

struct Inner<S> {
  catalog: Catalog<S>,
  datastore: DataStore,
  collections: Vec<Collection>,
  settings: PreloadSettings,
  state: watch::Sender<PreloadState>,
  progress: watch::Sender<PreloadProgress>,
  run: Mutex<RunState>,
}

/// Drives `Idle → Preloading → Ready` for one application context.
#[derive(Clone)]
pub struct PreloadOrchestrator<S> {
  inner: Arc<Inner<S>>,
}

impl<S: CollectionSource> PreloadOrchestrator<S> {
  pub fn new(catalog: Catalog<S>, datastore: DataStore, settings: PreloadSettings) -> Self {
    Self::with_collections(catalog, datastore, Collection::PRELOADED.to_vec(), settings)
  }

  pub fn with_collections(
    catalog: Catalog<S>,
    datastore: DataStore,
    collections: Vec<Collection>,
    settings: PreloadSettings,
  ) -> Self {
    let (state, _) = watch::channel(PreloadState::Idle);
    let (progress, _) = watch::channel(PreloadProgress::default());
    Self {
      inner: Arc::new(Inner {
        catalog,
        datastore,
        collections,
        settings,
        state,
        progress,
        run: Mutex::new(RunState {
          branch: None,
          generation: 0,
          running: None,
          last_loaded: None,
        }),
      }),
    }
  }

  pub fn state(&self) -> PreloadState {
    *self.inner.state.borrow()
  }

  pub fn watch(&self) -> watch::Receiver<PreloadState> {
    self.inner.state.subscribe()
  }

  /// Completed and total collections of the current run.
  pub fn progress(&self) -> watch::Receiver<PreloadProgress> {
    self.inner.progress.subscribe()
  }

  pub fn branch(&self) -> Option<String> {
    self.inner.lock_run().branch.clone()
  }

  pub fn datastore(&self) -> &DataStore {
    &self.inner.datastore
  }

  /// First run after login.
  pub async fn start(&self, branch: Option<String>) -> Arc<PreloadReport> {
    self.reset(branch);
    self.preload(PreloadMode::Initial).await
  }

  /// Drop everything held for the old branch and run again for the new one.
  pub async fn switch_branch(&self, branch: Option<String>) -> Arc<PreloadReport> {
    info!(branch = ?branch, "Branch switched, restarting preload");
    self.reset(branch);
    self.preload(PreloadMode::Initial).await
  }

  /// Back to `Idle` with an empty data store. Runs in progress finish but
  /// their results are dropped.
  pub fn reset(&self, branch: Option<String>) {
    {
      let mut run = self.inner.lock_run();
      run.generation += 1;
      run.branch = branch;
      run.running = None;
      run.last_loaded = None;
      self.inner.datastore.clear();
      self.inner.progress.send_replace(PreloadProgress::default());
    }
    self.inner.state.send_replace(PreloadState::Idle);
  }

  /// Run (or join the run already in progress for this generation).
  pub async fn preload(&self, mode: PreloadMode) -> Arc<PreloadReport> {
    let run = {
      let mut run = self.inner.lock_run();
      if let Some(running) = run.running.clone() {
        debug!("Preload already in progress, joining it");
        running
      } else {
        let future = self.launch(run.generation, run.branch.clone(), mode);
        run.running = Some(future.clone());
        self.inner.state.send_replace(PreloadState::Preloading);
        future
      }
    };
    run.await
  }

  fn launch(&self, generation: u64, branch: Option<String>, mode: PreloadMode) -> SharedRun {
    let inner = self.inner.clone();
    let failed_branch = branch.clone();
    tokio::spawn(async move { inner.run(generation, branch, mode).await })
      .map(move |joined| {
        joined.unwrap_or_else(|err| {
          warn!(error = %err, "Preload task failed");
          Arc::new(PreloadReport {
            branch: failed_branch,
            mode,
            errors: BTreeMap::from([("preload".to_string(), err.to_string())]),
            ..PreloadReport::default()
          })
        })
      })
      .boxed()
      .shared()
  }

  /// Refresh when the app comes back, unless the last load is recent.
  pub async fn on_foreground(&self) -> Option<Arc<PreloadReport>> {
    let due = {
      let run = self.inner.lock_run();
      self.state() == PreloadState::Ready
        && run
          .last_loaded
          .is_some_and(|at| at.elapsed() >= self.inner.settings.foreground_min_interval)
    };
    if !due {
      debug!("Foreground refresh skipped, data is recent");
      return None;
    }
    Some(self.preload(PreloadMode::Refresh).await)
  }

  /// Follow the event bus and the refresh timer: branch switches rerun the
  /// preload, logout resets, foreground events refresh if due.
  pub fn attach(&self, bus: &EventBus) -> JoinHandle<()> {
    let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
    let mut events = bus.subscribe();
    let period = self
      .inner
      .settings
      .refresh_interval
      .max(Duration::from_secs(1));

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        let event = tokio::select! {
          event = events.next() => match event {
            Some(event) => Some(event),
            None => break,
          },
          _ = ticker.tick() => None,
        };
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let orchestrator = PreloadOrchestrator { inner };

        match event {
          None => {
            if orchestrator.state() == PreloadState::Ready {
              tokio::spawn(async move {
                orchestrator.preload(PreloadMode::Refresh).await;
              });
            }
          }
          Some(CacheEvent::BranchSwitched { branch_id }) => {
            tokio::spawn(async move {
              orchestrator.switch_branch(Some(branch_id)).await;
            });
          }
          Some(CacheEvent::LoggedOut) => orchestrator.reset(None),
          Some(CacheEvent::Foreground) => {
            tokio::spawn(async move {
              orchestrator.on_foreground().await;
            });
          }
          Some(_) => {}
        }
      }
    })
  }
}

impl<S> Inner<S> {
  fn lock_run(&self) -> MutexGuard<'_, RunState> {
    self.run.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Apply `update` unless a reset has happened since `generation` started.
  fn report_progress(&self, generation: u64, update: impl FnOnce(&mut PreloadProgress)) {
    let run = self.lock_run();
    if run.generation == generation {
      self.progress.send_modify(update);
    }
  }

  fn publish<T: Cacheable>(&self, generation: u64, key: &CacheKey, data: Arc<Vec<T>>) -> bool {
    let run = self.lock_run();
    if run.generation != generation {
      debug!(key = %key, "Dropping preload result from a previous branch");
      return false;
    }
    self.datastore.set(key, data);
    true
  }
}

impl<S: CollectionSource> Inner<S> {
  async fn run(
    self: Arc<Self>,
    generation: u64,
    branch: Option<String>,
    mode: PreloadMode,
  ) -> Arc<PreloadReport> {
    let started = Instant::now();
    if mode == PreloadMode::Initial && !self.settings.initial_delay.is_zero() {
      tokio::time::sleep(self.settings.initial_delay).await;
    }

    let total = self.collections.len();
    self.report_progress(generation, |progress| {
      *progress = PreloadProgress {
        completed: 0,
        total,
      }
    });

    let outcomes = join_all(self.collections.iter().map(|collection| {
      let this = &self;
      let branch = branch.clone();
      async move {
        let outcome = this.warm(*collection, generation, branch, mode).await;
        this.report_progress(generation, |progress| progress.completed += 1);
        outcome
      }
    }))
    .await;

    let mut report = PreloadReport {
      branch,
      mode,
      ..PreloadReport::default()
    };
    for (collection, outcome) in self.collections.iter().zip(outcomes) {
      let name = collection.name().to_string();
      match outcome {
        Ok(Warmed::Cached) => {
          report.from_cache.push(name.clone());
          report.loaded.push(name);
        }
        Ok(Warmed::Fetched) => report.loaded.push(name),
        Err(err) => {
          warn!(collection = %name, error = %err, "Preload failed");
          report.errors.insert(name.clone(), err.user_message());
          report.failed.push(name);
        }
      }
    }
    report.duration = started.elapsed();

    {
      let mut run = self.lock_run();
      if run.generation != generation {
        report.superseded = true;
        return Arc::new(report);
      }
      run.running = None;
      run.last_loaded = Some(Instant::now());
    }
    self.state.send_replace(PreloadState::Ready);

    info!(
      branch = ?report.branch,
      loaded = report.loaded.len(),
      failed = report.failed.len(),
      from_cache = report.from_cache.len(),
      duration_ms = report.duration.as_millis() as u64,
      "Preload complete"
    );
    Arc::new(report)
  }

  async fn warm(
    self: &Arc<Self>,
    collection: Collection,
    generation: u64,
    branch: Option<String>,
    mode: PreloadMode,
  ) -> Result<Warmed, FetchError> {
    match collection {
      Collection::Products => {
        self
          .warm_typed::<Product>(collection, generation, branch, mode)
          .await
      }
      Collection::Variants => {
        self
          .warm_typed::<ProductVariant>(collection, generation, branch, mode)
          .await
      }
      Collection::Customers => {
        self
          .warm_typed::<Customer>(collection, generation, branch, mode)
          .await
      }
      Collection::Employees => {
        self
          .warm_typed::<Employee>(collection, generation, branch, mode)
          .await
      }
      Collection::PaymentMethods => {
        self
          .warm_typed::<PaymentMethod>(collection, generation, branch, mode)
          .await
      }
      Collection::Attendance => {
        self
          .warm_typed::<AttendanceRecord>(collection, generation, branch, mode)
          .await
      }
      Collection::Categories => {
        self
          .warm_typed::<Category>(collection, generation, branch, mode)
          .await
      }
      Collection::Suppliers => {
        self
          .warm_typed::<Supplier>(collection, generation, branch, mode)
          .await
      }
      Collection::Branches => {
        self
          .warm_typed::<Branch>(collection, generation, branch, mode)
          .await
      }
    }
  }

  /// Cached non-empty data is published at once and refreshed in the
  /// background; otherwise wait for one fetch.
  async fn warm_typed<T: Cacheable>(
    self: &Arc<Self>,
    collection: Collection,
    generation: u64,
    branch: Option<String>,
    mode: PreloadMode,
  ) -> Result<Warmed, FetchError> {
    let key = collection.key(branch.as_deref());

    if mode == PreloadMode::Initial {
      let cached = self
        .catalog
        .cache()
        .cached::<T>(&key)
        .await
        .filter(|data| !data.is_empty());
      if let Some(data) = cached {
        self.publish(generation, &key, data);
        self.refresh_in_background::<T>(collection, generation, branch);
        return Ok(Warmed::Cached);
      }
    }

    let options = match mode {
      PreloadMode::Initial => FetchOptions::default(),
      PreloadMode::Refresh => FetchOptions::force(),
    };
    let data = self
      .catalog
      .load::<T>(collection, branch.as_deref(), options)
      .await?;
    self.publish(generation, &key, data);
    Ok(Warmed::Fetched)
  }

  fn refresh_in_background<T: Cacheable>(
    self: &Arc<Self>,
    collection: Collection,
    generation: u64,
    branch: Option<String>,
  ) {
    let inner = Arc::clone(self);
    tokio::spawn(async move {
      let key = collection.key(branch.as_deref());
      match inner
        .catalog
        .load::<T>(collection, branch.as_deref(), FetchOptions::force())
        .await
      {
        Ok(data) => {
          inner.publish(generation, &key, data);
        }
        Err(err) => {
          debug!(key = %key, error = %err, "Background refresh failed, keeping cached data")
        }
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{DurableStore, MemoryStorage, SmartCache};
  use crate::source::testing::StubSource;
  use serde_json::json;

  fn customers() -> Vec<serde_json::Value> {
    vec![
      json!({"id": "c1", "name": "Amina", "branch_id": "b1"}),
      json!({"id": "c2", "name": "Baraka", "branch_id": "b1"}),
      json!({"id": "c3", "name": "Chausiku", "branch_id": "b2"}),
    ]
  }

  fn orchestrator(
    source: &StubSource,
    store: Arc<dyn DurableStore>,
  ) -> PreloadOrchestrator<StubSource> {
    let catalog = Catalog::new(source.clone(), SmartCache::new(store));
    PreloadOrchestrator::with_collections(
      catalog,
      DataStore::new(),
      vec![Collection::Customers],
      PreloadSettings::default(),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_cold_start_fetches_then_ready() {
    let source = StubSource::new();
    source.set_rows("customers", customers());
    let preload = orchestrator(&source, Arc::new(MemoryStorage::default()));
    let mut states = preload.watch();
    assert_eq!(preload.state(), PreloadState::Idle);

    let report = preload.start(Some("b1".into())).await;

    assert!(report.success());
    assert_eq!(report.loaded, vec!["customers".to_string()]);
    assert!(report.from_cache.is_empty());
    assert!(report.duration >= Duration::from_millis(250));
    assert_eq!(preload.state(), PreloadState::Ready);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), PreloadState::Ready);

    let held = preload.datastore().get::<Customer>("customers_b1").unwrap();
    assert_eq!(held.len(), 2);
    assert_eq!(source.calls(), 1);

    let progress = *preload.progress().borrow();
    assert_eq!(progress, PreloadProgress { completed: 1, total: 1 });
    assert_eq!(progress.percent(), 100);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cached_data_is_ready_at_once_and_refreshed() {
    let source = StubSource::new();
    source.set_rows("customers", customers());
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStorage::default());

    // A previous session left the collection on disk
    let earlier = Catalog::new(source.clone(), SmartCache::new(store.clone()));
    earlier
      .customers(Some("b1"), FetchOptions::default())
      .await
      .unwrap();
    earlier.cache().flush().await;
    assert_eq!(source.calls(), 1);

    let preload = orchestrator(&source, store);
    let report = preload.start(Some("b1".into())).await;
    assert_eq!(report.from_cache, vec!["customers".to_string()]);
    assert!(preload.datastore().contains("customers_b1"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_preloads_share_one_run() {
    let source = StubSource::new().with_delay(Duration::from_millis(100));
    source.set_rows("customers", customers());
    let preload = orchestrator(&source, Arc::new(MemoryStorage::default()));
    preload.reset(Some("b1".into()));

    let (a, b) = tokio::join!(
      preload.preload(PreloadMode::Initial),
      preload.preload(PreloadMode::Initial)
    );
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(source.calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_branch_switch_drops_old_branch() {
    let source = StubSource::new().with_delay(Duration::from_millis(100));
    source.set_rows("customers", customers());
    let preload = orchestrator(&source, Arc::new(MemoryStorage::default()));

    let first = {
      let preload = preload.clone();
      tokio::spawn(async move { preload.start(Some("b1".into())).await })
    };
    // Past the initial delay, before the b1 fetch lands
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(preload.state(), PreloadState::Preloading);

    let second = preload.switch_branch(Some("b2".into())).await;
    let first = first.await.unwrap();

    assert!(first.superseded);
    assert!(second.success());
    assert_eq!(preload.branch().as_deref(), Some("b2"));
    assert_eq!(preload.datastore().keys(), vec!["customers_b2".to_string()]);
    assert_eq!(preload.state(), PreloadState::Ready);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failures_are_reported() {
    let source = StubSource::new();
    source.fail_with(Some(FetchError::fatal("relation does not exist")));
    let preload = orchestrator(&source, Arc::new(MemoryStorage::default()));

    let report = preload.start(None).await;
    assert!(!report.success());
    assert_eq!(report.failed, vec!["customers".to_string()]);
    assert_eq!(report.errors["customers"], "relation does not exist");
    assert_eq!(preload.state(), PreloadState::Ready);
    assert!(preload.datastore().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_foreground_refresh_needs_elapsed_time() {
    let source = StubSource::new();
    source.set_rows("customers", customers());
    let preload = orchestrator(&source, Arc::new(MemoryStorage::default()));

    assert!(preload.on_foreground().await.is_none());
    preload.start(Some("b1".into())).await;
    assert!(preload.on_foreground().await.is_none());

    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    let report = preload.on_foreground().await.unwrap();
    assert_eq!(report.mode, PreloadMode::Refresh);
    assert_eq!(source.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_bus_events_drive_orchestrator() {
    let source = StubSource::new();
    source.set_rows("customers", customers());
    let preload = orchestrator(&source, Arc::new(MemoryStorage::default()));
    let bus = EventBus::default();
    let _listener = preload.attach(&bus);

    preload.start(Some("b1".into())).await;
    bus.publish(CacheEvent::BranchSwitched {
      branch_id: "b2".into(),
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(preload.branch().as_deref(), Some("b2"));
    assert_eq!(preload.datastore().keys(), vec!["customers_b2".to_string()]);

    bus.publish(CacheEvent::LoggedOut);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(preload.state(), PreloadState::Idle);
    assert!(preload.datastore().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_timer_refreshes_when_ready() {
    let source = StubSource::new();
    source.set_rows("customers", customers());
    let preload = orchestrator(&source, Arc::new(MemoryStorage::default()));
    let bus = EventBus::default();
    let _listener = preload.attach(&bus);

    preload.start(Some("b1".into())).await;
    assert_eq!(source.calls(), 1);

    let interval = PreloadSettings::default().refresh_interval;
    tokio::time::sleep(interval + Duration::from_secs(1)).await;
    assert_eq!(source.calls(), 2);
    assert_eq!(preload.state(), PreloadState::Ready);
    assert_eq!(preload.datastore().keys(), vec!["customers_b1".to_string()]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_progress_counts_collections() {
    let source = StubSource::new().with_delay(Duration::from_millis(100));
    source.set_rows("customers", customers());
    source.set_rows("lats_categories", vec![json!({"id": "k1", "name": "Phones"})]);
    let catalog = Catalog::new(source.clone(), SmartCache::new(Arc::new(MemoryStorage::default())));
    let preload = PreloadOrchestrator::with_collections(
      catalog,
      DataStore::new(),
      vec![Collection::Customers, Collection::Categories],
      PreloadSettings::default(),
    );

    let run = {
      let preload = preload.clone();
      tokio::spawn(async move { preload.start(Some("b1".into())).await })
    };
    // Past the initial delay, before either fetch lands
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*preload.progress().borrow(), PreloadProgress { completed: 0, total: 2 });

    run.await.unwrap();
    let done = *preload.progress().borrow();
    assert_eq!(done, PreloadProgress { completed: 2, total: 2 });

    preload.reset(None);
    assert_eq!(preload.progress().borrow().percent(), 0);
  }
}
