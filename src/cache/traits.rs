//! Core traits and types for the caching system.

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};

/// Trait for records that can be cached.
///
/// The cache treats a collection as an ordered `Vec` of these; it never looks
/// inside a record beyond its id.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this record (e.g., product id)
  fn cache_key(&self) -> String;

  /// Collection name for storage organization (e.g., "products", "customers")
  fn collection() -> &'static str;
}

/// What a key's partition id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  /// The active branch; keys of this kind go stale on a branch switch
  Branch,
  /// Any other owner, e.g. a parent variant
  Other,
}

/// Identifier for one cached collection.
///
/// Partitioned keys fold the partition id (branch, parent variant) into the
/// rendered key, so `customers` for branch `A` is `customers_A`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  collection: String,
  partition: Option<(PartitionKind, String)>,
  rendered: String,
}

impl CacheKey {
  pub fn new(collection: impl Into<String>) -> Self {
    let collection = collection.into();
    Self {
      rendered: collection.clone(),
      collection,
      partition: None,
    }
  }

  fn with_partition(
    collection: impl Into<String>,
    kind: PartitionKind,
    partition: impl Into<String>,
  ) -> Self {
    let collection = collection.into();
    let partition = partition.into();
    Self {
      rendered: format!("{}_{}", collection, partition),
      collection,
      partition: Some((kind, partition)),
    }
  }

  /// Key partitioned by something other than the branch.
  pub fn partitioned(collection: impl Into<String>, partition: impl Into<String>) -> Self {
    Self::with_partition(collection, PartitionKind::Other, partition)
  }

  pub fn branch(collection: impl Into<String>, branch: impl Into<String>) -> Self {
    Self::with_partition(collection, PartitionKind::Branch, branch)
  }

  /// Branch partition when given one, plain key otherwise
  pub fn scoped(collection: impl Into<String>, branch: Option<&str>) -> Self {
    match branch {
      Some(branch) => Self::branch(collection, branch),
      None => Self::new(collection),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.rendered
  }

  pub fn collection(&self) -> &str {
    &self.collection
  }

  pub fn partition(&self) -> Option<&str> {
    self.partition.as_ref().map(|(_, id)| id.as_str())
  }

  pub fn partition_kind(&self) -> Option<PartitionKind> {
    self.partition.as_ref().map(|(kind, _)| *kind)
  }

  pub fn is_branch_scoped(&self) -> bool {
    self.partition_kind() == Some(PartitionKind::Branch)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.rendered)
  }
}

impl From<&str> for CacheKey {
  fn from(key: &str) -> Self {
    CacheKey::new(key)
  }
}

impl From<String> for CacheKey {
  fn from(key: String) -> Self {
    CacheKey::new(key)
  }
}

impl From<&CacheKey> for CacheKey {
  fn from(key: &CacheKey) -> Self {
    key.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partitioned_key_rendering() {
    let key = CacheKey::partitioned("customers", "A");
    assert_eq!(key.as_str(), "customers_A");
    assert_eq!(key.collection(), "customers");
    assert_eq!(key.partition(), Some("A"));
    assert_ne!(key, CacheKey::partitioned("customers", "B"));
    assert!(!key.is_branch_scoped());
  }

  #[test]
  fn test_branch_key() {
    let key = CacheKey::scoped("customers", Some("A"));
    assert_eq!(key.as_str(), "customers_A");
    assert_eq!(key.partition_kind(), Some(PartitionKind::Branch));
    assert!(key.is_branch_scoped());
    let children = CacheKey::partitioned("variant_children", "p1");
    assert_eq!(children.partition_kind(), Some(PartitionKind::Other));
  }

  #[test]
  fn test_plain_key() {
    let key: CacheKey = "products".into();
    assert_eq!(key.to_string(), "products");
    assert_eq!(key.partition(), None);
    assert_eq!(CacheKey::scoped("products", None), key);
  }
}
