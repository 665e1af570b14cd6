//! Poll-driven collection queries for UI frame loops.
//!
//! A `CollectionQuery<T>` binds one cache key to a render loop. Data is taken
//! from the first tier that has it:
//!
//! 1. the preloaded [`DataStore`]
//! 2. the hook-level [`LocalCache`] (TTL, default 5 minutes)
//! 3. a fetch already in flight for the same key
//! 4. the network, through the retry policy
//!
//! # Example
//!
//! ```ignore
//! let mut customers = hooks.customers(Some("branch-1"));
//!
//! // Start fetching
//! customers.fetch();
//!
//! // In event loop tick
//! if customers.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match customers.data() {
//!     Some(rows) => render_rows(rows),
//!     None if customers.is_loading() => render_spinner(),
//!     None => render_empty(customers.error()),
//! }
//! ```

mod entities;
mod local;

pub use entities::{AttendanceFilter, Hooks};
pub use local::{Fetcher, LocalCache, DEFAULT_FETCH_TIMEOUT};

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{CacheKey, Cacheable};
use crate::datastore::DataStore;
use crate::error::FetchError;
use crate::retry::RetryPolicy;

/// Default lifetime of hook-level cache entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Which tier served the current data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  Preloaded,
  LocalCache,
  InFlight,
  Network,
}

/// Everything a render needs: `{data, loading, error}`.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub data: Option<Arc<Vec<T>>>,
  pub loading: bool,
  pub error: Option<String>,
  pub source: Option<DataSource>,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
      source: None,
    }
  }
}

/// Tiers shared by every query of an application context.
#[derive(Clone)]
pub struct QueryContext {
  pub datastore: DataStore,
  pub local: LocalCache,
  pub retry: RetryPolicy,
  pub ttl: Duration,
}

impl QueryContext {
  pub fn new(datastore: DataStore, retry: RetryPolicy) -> Self {
    Self {
      datastore,
      local: LocalCache::new(),
      retry,
      ttl: DEFAULT_TTL,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Bound every hook fetch, retries included.
  pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
    self.local = self.local.with_fetch_timeout(timeout);
    self
  }
}

impl Default for QueryContext {
  fn default() -> Self {
    Self::new(DataStore::new(), RetryPolicy::default())
  }
}

type PostFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type Delivery<T> = Result<(Arc<Vec<T>>, DataSource), FetchError>;

/// Async collection query with `{data, loading, error, refetch}`.
///
/// Not Clone: the receiver is owned. Dropping a query while it loads does not
/// cancel the fetch; the result still lands in the [`LocalCache`].
pub struct CollectionQuery<T> {
  ctx: QueryContext,
  key: CacheKey,
  fetcher: Fetcher<T>,
  filter: Option<PostFilter<T>>,
  ttl: Duration,
  state: QueryState<T>,
  receiver: Option<mpsc::UnboundedReceiver<Delivery<T>>>,
}

impl<T: Cacheable> CollectionQuery<T> {
  /// Create a query for `key` with the given fetcher function.
  ///
  /// The fetcher is called each time a fetch reaches the network tier.
  pub fn new<F, Fut>(ctx: QueryContext, key: impl Into<CacheKey>, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
  {
    let fetcher: Fetcher<T> = Arc::new(move || fetcher().boxed());
    Self {
      ttl: ctx.ttl,
      ctx,
      key: key.into(),
      fetcher,
      filter: None,
      state: QueryState::default(),
      receiver: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Narrow the rows after retrieval. The filter never enters the key.
  pub fn with_filter<P>(mut self, predicate: P) -> Self
  where
    P: Fn(&T) -> bool + Send + Sync + 'static,
  {
    self.filter = Some(Arc::new(predicate));
    self
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&Arc<Vec<T>>> {
    self.state.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.loading
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error.as_deref()
  }

  pub fn source(&self) -> Option<DataSource> {
    self.state.source
  }

  /// Start fetching if not already loading.
  ///
  /// Cached tiers are answered synchronously; only a network fetch leaves the
  /// query loading.
  pub fn fetch(&mut self) {
    if self.state.loading {
      return;
    }
    self.start(false);
  }

  /// Go to the network, bypassing every cached tier.
  pub fn refetch(&mut self) {
    // Replies to the previous fetch are no longer wanted
    self.receiver = None;
    self.start(true);
  }

  /// Apply a pending result, if one arrived. Returns `true` if the state
  /// changed.
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };

    match receiver.try_recv() {
      Ok(delivery) => {
        self.receiver = None;
        self.deliver(delivery);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.receiver = None;
        self.fail("Query was cancelled".to_string());
        true
      }
    }
  }

  /// Wait for the pending result and apply it.
  pub async fn settle(&mut self) -> &QueryState<T> {
    if let Some(mut receiver) = self.receiver.take() {
      match receiver.recv().await {
        Some(delivery) => self.deliver(delivery),
        None => self.fail("Query was cancelled".to_string()),
      }
    }
    &self.state
  }

  fn start(&mut self, force: bool) {
    if !force {
      if let Some(data) = self.ctx.datastore.get::<T>(&self.key) {
        self.apply(data, DataSource::Preloaded);
        return;
      }
      if let Some(data) = self.ctx.local.get::<T>(self.key.as_str(), self.ttl) {
        self.apply(data, DataSource::LocalCache);
        return;
      }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state.loading = true;

    let local = self.ctx.local.clone();
    let retry = self.ctx.retry.clone();
    let fetcher = self.fetcher.clone();
    let key = self.key.as_str().to_string();
    let ttl = self.ttl;
    tokio::spawn(async move {
      let result = local.load(&key, ttl, force, &retry, fetcher).await;
      // Ignore send errors - the query may have been dropped
      let _ = tx.send(result);
    });
  }

  fn deliver(&mut self, delivery: Delivery<T>) {
    match delivery {
      Ok((data, source)) => self.apply(data, source),
      Err(err) => {
        debug!(key = %self.key, error = %err, "Query failed");
        self.fail(err.user_message());
      }
    }
  }

  fn apply(&mut self, data: Arc<Vec<T>>, source: DataSource) {
    let data = match &self.filter {
      Some(keep) => Arc::new(data.iter().filter(|row| keep(row)).cloned().collect()),
      None => data,
    };
    self.state = QueryState {
      data: Some(data),
      loading: false,
      error: None,
      source: Some(source),
    };
  }

  /// Keep the last-known data so the view does not flicker to empty.
  fn fail(&mut self, message: String) {
    self.state.loading = false;
    self.state.error = Some(message);
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CollectionQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CollectionQuery")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("ttl", &self.ttl)
      .finish_non_exhaustive()
  }
}
