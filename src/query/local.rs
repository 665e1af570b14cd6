//! Hook-level TTL cache with in-flight deduplication.
//!
//! Independent of [`SmartCache`](crate::cache::SmartCache): entries expire
//! after a fixed lifetime and are never persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::DataSource;
use crate::error::FetchError;
use crate::retry::RetryPolicy;

type Erased = Arc<dyn std::any::Any + Send + Sync>;
type PendingFetch = Shared<BoxFuture<'static, Result<Erased, FetchError>>>;

/// Hard ceiling for one hook fetch including all retries.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// A fetch function as stored by queries.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<T>, FetchError>> + Send + Sync>;

struct Entry {
  data: Erased,
  stored_at: Instant,
  seq: u64,
}

struct Pending {
  seq: u64,
  future: PendingFetch,
}

#[derive(Default)]
struct LocalState {
  entries: HashMap<String, Entry>,
  pending: HashMap<String, Pending>,
  /// Results from fetches at or below a key's floor are discarded
  floors: HashMap<String, u64>,
  cleared_at: u64,
  next_seq: u64,
}

impl LocalState {
  fn fresh(&self, key: &str, ttl: Duration) -> Option<Erased> {
    self
      .entries
      .get(key)
      .filter(|entry| entry.stored_at.elapsed() < ttl)
      .map(|entry| entry.data.clone())
  }

  fn accepts(&self, key: &str, seq: u64) -> bool {
    seq > self.cleared_at
      && self.floors.get(key).map_or(true, |floor| seq > *floor)
      && self.entries.get(key).map_or(true, |entry| seq > entry.seq)
  }
}

/// Clones share entries and in-flight fetches.
#[derive(Clone)]
pub struct LocalCache {
  state: Arc<Mutex<LocalState>>,
  fetch_timeout: Duration,
}

impl Default for LocalCache {
  fn default() -> Self {
    Self {
      state: Arc::default(),
      fetch_timeout: DEFAULT_FETCH_TIMEOUT,
    }
  }
}

impl LocalCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
    self.fetch_timeout = timeout;
    self
  }

  pub fn fetch_timeout(&self) -> Duration {
    self.fetch_timeout
  }

  fn lock(&self) -> MutexGuard<'_, LocalState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Entry for `key` if it is younger than `ttl`.
  pub fn get<T: Send + Sync + 'static>(&self, key: &str, ttl: Duration) -> Option<Arc<Vec<T>>> {
    let data = self.lock().fresh(key, ttl)?;
    data.downcast::<Vec<T>>().ok()
  }

  pub fn is_pending(&self, key: &str) -> bool {
    self.lock().pending.contains_key(key)
  }

  /// Drop `key` and ignore any fetch for it that is already running.
  pub fn invalidate(&self, key: &str) {
    let mut state = self.lock();
    state.entries.remove(key);
    state.pending.remove(key);
    let floor = state.next_seq;
    state.floors.insert(key.to_string(), floor);
  }

  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.pending.clear();
    state.floors.clear();
    state.cleared_at = state.next_seq;
  }

  /// Resolve `key`: a live entry, then a fetch already in flight, then a new
  /// fetch through `retry`. `force` skips straight to a new fetch.
  pub async fn load<T: Send + Sync + 'static>(
    &self,
    key: &str,
    ttl: Duration,
    force: bool,
    retry: &RetryPolicy,
    fetcher: Fetcher<T>,
  ) -> Result<(Arc<Vec<T>>, DataSource), FetchError> {
    let (future, source) = {
      let mut state = self.lock();
      let reuse = if force {
        None
      } else if let Some(data) = state.fresh(key, ttl) {
        let ready = futures::future::ready(Ok::<_, FetchError>(data)).boxed().shared();
        Some((ready, DataSource::LocalCache))
      } else {
        state
          .pending
          .get(key)
          .map(|pending| (pending.future.clone(), DataSource::InFlight))
      };
      match reuse {
        Some(found) => found,
        None => (
          self.start(&mut state, key, retry.clone(), fetcher),
          DataSource::Network,
        ),
      }
    };

    let data = future.await?;
    let typed = data
      .downcast::<Vec<T>>()
      .map_err(|_| FetchError::fatal(format!("Cached value for {} has an unexpected type", key)))?;
    Ok((typed, source))
  }

  fn start<T: Send + Sync + 'static>(
    &self,
    state: &mut LocalState,
    key: &str,
    retry: RetryPolicy,
    fetcher: Fetcher<T>,
  ) -> PendingFetch {
    state.next_seq += 1;
    let seq = state.next_seq;
    let cache = self.clone();
    let owned_key = key.to_string();
    let ceiling = self.fetch_timeout;

    let handle = tokio::spawn(async move {
      let result = match tokio::time::timeout(ceiling, retry.run(|| fetcher())).await {
        Ok(result) => result.map(|rows| Arc::new(rows) as Erased),
        Err(_) => {
          warn!(
            key = %owned_key,
            timeout_secs = ceiling.as_secs(),
            "Hook fetch exceeded hard ceiling"
          );
          Err(FetchError::Timeout(ceiling))
        }
      };
      cache.settle(&owned_key, seq, &result);
      result
    });

    let future = handle
      .map(|joined| {
        joined.unwrap_or_else(|err| Err(FetchError::fatal(format!("Fetch task failed: {}", err))))
      })
      .boxed()
      .shared();

    state.pending.insert(
      key.to_string(),
      Pending {
        seq,
        future: future.clone(),
      },
    );
    debug!(key, seq, "Hook fetch started");
    future
  }

  fn settle(&self, key: &str, seq: u64, result: &Result<Erased, FetchError>) {
    let mut state = self.lock();
    if state.pending.get(key).is_some_and(|p| p.seq == seq) {
      state.pending.remove(key);
    }
    if let Ok(data) = result {
      if state.accepts(key, seq) {
        state.entries.insert(
          key.to_string(),
          Entry {
            data: data.clone(),
            stored_at: Instant::now(),
            seq,
          },
        );
      } else {
        debug!(key, seq, "Discarding superseded hook fetch");
      }
    }
  }
}
