//! In-memory cache entries, their status machine, and sequence bookkeeping.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tracing::warn;

use super::freshness::{Freshness, FreshnessPolicy};
use super::traits::CacheKey;
use crate::error::FetchError;

/// Collection data held type-erased; always a `Vec<T>` for some `T: Cacheable`.
pub type ErasedData = Arc<dyn Any + Send + Sync>;

pub type FetchOutcome = Result<ErasedData, FetchError>;

/// Shared handle to an outbound fetch; clones resolve to the same outcome.
pub type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
  Empty,
  Loading,
  Fresh,
  Stale,
  Error,
}

impl CacheStatus {
  pub fn can_transition_to(self, next: CacheStatus) -> bool {
    use CacheStatus::*;
    matches!(
      (self, next),
      (Empty, Loading)
        | (Loading, Fresh)
        | (Loading, Error)
        | (Fresh, Stale)
        | (Stale, Loading)
        | (Error, Loading)
    )
  }
}

impl fmt::Display for CacheStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      CacheStatus::Empty => "empty",
      CacheStatus::Loading => "loading",
      CacheStatus::Fresh => "fresh",
      CacheStatus::Stale => "stale",
      CacheStatus::Error => "error",
    };
    f.write_str(name)
  }
}

#[derive(Clone)]
pub struct InFlight {
  pub seq: u64,
  pub future: SharedFetch,
}

/// Result of committing a fetch to an entry.
pub enum Commit {
  /// The data was stored; `changed` is set when subscribers should hear about it.
  Applied { changed: bool },
  /// A newer fetch already committed; carries the data now held.
  Superseded { latest: Option<ErasedData> },
}

pub struct CacheEntry {
  pub key: CacheKey,
  pub data: Option<ErasedData>,
  pub item_count: usize,
  pub status: CacheStatus,
  pub fetched_at: Option<DateTime<Utc>>,
  pub in_flight: Option<InFlight>,
  pub error: Option<FetchError>,
  /// Sequence number of the fetch whose data is held
  pub committed_seq: u64,
  /// Checksum of the content subscribers last saw
  pub checksum: Option<String>,
  /// The durable store refused the last write for this key
  pub memory_only: bool,
}

impl CacheEntry {
  pub fn empty(key: CacheKey) -> Self {
    Self {
      key,
      data: None,
      item_count: 0,
      status: CacheStatus::Empty,
      fetched_at: None,
      in_flight: None,
      error: None,
      committed_seq: 0,
      checksum: None,
      memory_only: false,
    }
  }

  /// Build an entry from a persisted record. Seeding is construction, not a
  /// transition: the entry starts out `Fresh` and ages like any other.
  pub fn seeded(
    key: CacheKey,
    data: ErasedData,
    item_count: usize,
    fetched_at: DateTime<Utc>,
    checksum: String,
  ) -> Self {
    Self {
      data: Some(data),
      item_count,
      status: CacheStatus::Fresh,
      fetched_at: Some(fetched_at),
      checksum: Some(checksum),
      ..Self::empty(key)
    }
  }

  /// Move to `next` if the transition is legal. Illegal attempts are logged
  /// and leave the entry untouched.
  pub fn transition(&mut self, next: CacheStatus) -> bool {
    if !self.status.can_transition_to(next) {
      warn!(
        key = %self.key,
        from = %self.status,
        to = %next,
        "Rejected illegal cache status transition"
      );
      return false;
    }
    self.status = next;
    true
  }

  /// Demote `Fresh` data that has aged out of its window and report where
  /// the data sits now.
  pub fn age_out(&mut self, policy: &FreshnessPolicy, now: DateTime<Utc>) -> Freshness {
    let freshness = policy.classify(self.fetched_at, now);
    if self.status == CacheStatus::Fresh && freshness != Freshness::Fresh {
      self.transition(CacheStatus::Stale);
    }
    freshness
  }

  /// Register the fetch `seq` as the one in flight.
  ///
  /// While already loading, the new fetch supersedes the old one as owner of
  /// the entry; the old one may still commit if it finishes first.
  pub fn begin_fetch(&mut self, seq: u64, future: SharedFetch) {
    match self.status {
      CacheStatus::Loading => {}
      CacheStatus::Fresh => {
        self.transition(CacheStatus::Stale);
        self.transition(CacheStatus::Loading);
      }
      _ => {
        self.transition(CacheStatus::Loading);
      }
    }
    self.in_flight = Some(InFlight { seq, future });
  }

  fn settle_fresh(&mut self) {
    match self.status {
      CacheStatus::Fresh => {}
      CacheStatus::Loading => {
        self.transition(CacheStatus::Fresh);
      }
      CacheStatus::Stale | CacheStatus::Error | CacheStatus::Empty => {
        self.transition(CacheStatus::Loading);
        self.transition(CacheStatus::Fresh);
      }
    }
  }

  /// Commit the result of fetch `seq`.
  ///
  /// Results older than the one already held are ignored. The owner of the
  /// in-flight slot clears it and moves the entry to `Fresh`; a result that
  /// lands while a newer fetch is still running updates the data but leaves
  /// the entry loading.
  pub fn complete(
    &mut self,
    seq: u64,
    data: ErasedData,
    item_count: usize,
    fetched_at: DateTime<Utc>,
    checksum: Option<String>,
  ) -> Commit {
    if seq <= self.committed_seq {
      return Commit::Superseded {
        latest: self.data.clone(),
      };
    }

    self.committed_seq = seq;
    self.data = Some(data);
    self.item_count = item_count;
    self.fetched_at = Some(fetched_at);
    self.error = None;

    let owner = self.in_flight.as_ref().map(|f| f.seq);
    match owner {
      Some(owner) if owner != seq => Commit::Applied { changed: false },
      _ => {
        self.in_flight = None;
        self.settle_fresh();
        let changed = checksum.is_none() || checksum != self.checksum;
        self.checksum = checksum;
        Commit::Applied { changed }
      }
    }
  }

  /// Record the failure of fetch `seq`. Only the current owner of the
  /// in-flight slot moves the entry to `Error`; data is kept.
  pub fn fail(&mut self, seq: u64, error: FetchError) -> bool {
    match &self.in_flight {
      Some(in_flight) if in_flight.seq == seq => {
        self.in_flight = None;
        self.transition(CacheStatus::Error);
        self.error = Some(error);
        true
      }
      _ => false,
    }
  }

  /// Forget when the data was fetched so the next read refreshes it.
  pub fn invalidate(&mut self) {
    self.fetched_at = None;
    if self.status == CacheStatus::Fresh {
      self.transition(CacheStatus::Stale);
    }
  }
}

/// Process-scoped map of cache entries.
#[derive(Default)]
pub struct Registry {
  entries: HashMap<String, CacheEntry>,
  next_seq: u64,
  epoch: u64,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  pub fn get(&self, key: &str) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
    self.entries.get_mut(key)
  }

  /// Entry for `key`, created `Empty` on first touch.
  pub fn entry(&mut self, key: &CacheKey) -> &mut CacheEntry {
    self
      .entries
      .entry(key.as_str().to_string())
      .or_insert_with(|| CacheEntry::empty(key.clone()))
  }

  /// Install a seeded entry unless the key already holds something.
  pub fn seed(&mut self, entry: CacheEntry) -> bool {
    match self.entries.get(entry.key.as_str()) {
      Some(existing) if existing.status != CacheStatus::Empty => false,
      _ => {
        self.entries.insert(entry.key.as_str().to_string(), entry);
        true
      }
    }
  }

  pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
    self.entries.values()
  }

  pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry> {
    self.entries.values_mut()
  }

  pub fn allocate_seq(&mut self) -> u64 {
    self.next_seq += 1;
    self.next_seq
  }

  /// Generation counter bumped by every [`Registry::clear`].
  pub fn epoch(&self) -> u64 {
    self.epoch
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.epoch += 1;
  }
}
