//! Session-wide store of preloaded collections.
//!
//! The preload orchestrator publishes into it and consumption hooks read it
//! first. It holds no freshness state of its own: whatever is here is what the
//! orchestrator decided the current branch should see.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::cache::{CacheKey, Cacheable};

type Slot = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct DataStore {
  slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl DataStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Preloaded value for `key`, if one of type `T` is held.
  pub fn get<T: Cacheable>(&self, key: impl Into<CacheKey>) -> Option<Arc<Vec<T>>> {
    let key = key.into();
    let slot = self.lock().get(key.as_str()).cloned()?;
    slot.downcast::<Vec<T>>().ok()
  }

  pub fn set<T: Cacheable>(&self, key: impl Into<CacheKey>, data: Arc<Vec<T>>) {
    let key = key.into();
    debug!(key = %key, items = data.len(), "Preloaded collection published");
    self.lock().insert(key.as_str().to_string(), data);
  }

  pub fn contains(&self, key: impl Into<CacheKey>) -> bool {
    let key = key.into();
    self.lock().contains_key(key.as_str())
  }

  pub fn remove(&self, key: impl Into<CacheKey>) -> bool {
    let key = key.into();
    self.lock().remove(key.as_str()).is_some()
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Row {
    id: u32,
  }

  impl Cacheable for Row {
    fn cache_key(&self) -> String {
      self.id.to_string()
    }

    fn collection() -> &'static str {
      "rows"
    }
  }

  #[test]
  fn test_typed_get() {
    let store = DataStore::new();
    store.set(CacheKey::partitioned("rows", "b1"), Arc::new(vec![Row { id: 1 }]));

    let rows = store.get::<Row>("rows_b1").unwrap();
    assert_eq!(rows.as_slice(), &[Row { id: 1 }]);
    assert!(store.get::<Row>("rows_b2").is_none());
  }

  #[test]
  fn test_wrong_type_is_a_miss() {
    let store = DataStore::new();
    store.set("rows", Arc::new(vec![Row { id: 1 }]));
    assert!(store.get::<crate::models::Customer>("rows").is_none());
    assert!(store.contains("rows"));
  }

  #[test]
  fn test_clear_and_remove() {
    let store = DataStore::new();
    store.set("a", Arc::new(vec![Row { id: 1 }]));
    store.set("b", Arc::new(vec![Row { id: 2 }]));
    assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);

    assert!(store.remove("a"));
    assert!(!store.remove("a"));
    store.clear();
    assert!(store.is_empty());
  }
}
