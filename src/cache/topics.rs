//! Per-key listener sets with disposable subscriptions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::registry::ErasedData;

pub type Listener = Arc<dyn Fn(&ErasedData) + Send + Sync>;

#[derive(Default)]
pub struct Topics {
  next_id: u64,
  listeners: HashMap<String, BTreeMap<u64, Listener>>,
}

impl Topics {
  pub fn add(&mut self, key: &str, listener: Listener) -> u64 {
    self.next_id += 1;
    let id = self.next_id;
    self
      .listeners
      .entry(key.to_string())
      .or_default()
      .insert(id, listener);
    id
  }

  pub fn remove(&mut self, key: &str, id: u64) -> bool {
    let Some(set) = self.listeners.get_mut(key) else {
      return false;
    };
    let removed = set.remove(&id).is_some();
    if set.is_empty() {
      self.listeners.remove(key);
    }
    removed
  }

  /// Copy of the current listener set, in subscription order
  pub fn snapshot(&self, key: &str) -> Vec<Listener> {
    self
      .listeners
      .get(key)
      .map(|set| set.values().cloned().collect())
      .unwrap_or_default()
  }

  pub fn count(&self, key: &str) -> usize {
    self.listeners.get(key).map_or(0, BTreeMap::len)
  }
}

/// Invoke every listener of `key` with `data`.
///
/// Listeners run on a snapshot taken under the lock and are called after it
/// is released, so they may subscribe or unsubscribe freely.
pub fn publish(topics: &Mutex<Topics>, key: &str, data: &ErasedData) -> usize {
  let listeners = topics
    .lock()
    .unwrap_or_else(PoisonError::into_inner)
    .snapshot(key);
  for listener in &listeners {
    listener(data);
  }
  listeners.len()
}

/// Handle returned by `subscribe`; dropping it or calling
/// [`Subscription::unsubscribe`] removes the listener.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  key: String,
  id: u64,
  topics: Option<Weak<Mutex<Topics>>>,
}

impl Subscription {
  pub(crate) fn new(key: String, id: u64, topics: Weak<Mutex<Topics>>) -> Self {
    Self {
      key,
      id,
      topics: Some(topics),
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn unsubscribe(mut self) {
    self.detach();
  }

  fn detach(&mut self) {
    let Some(topics) = self.topics.take().and_then(|weak| weak.upgrade()) else {
      return;
    };
    topics
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.key, self.id);
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.detach();
  }
}
