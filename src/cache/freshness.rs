//! Freshness windows and age classification.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Where a cached collection sits on the freshness timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
  /// Inside the fresh window; served without touching the network
  Fresh,
  /// Served immediately, refreshed in the background
  Stale,
  /// Unreliable; callers block on a refresh and only fall back to it on failure
  Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
  pub fresh_for: Duration,
  pub expire_after: Duration,
}

impl FreshnessPolicy {
  pub fn new(fresh_for: Duration, expire_after: Duration) -> Self {
    Self {
      fresh_for,
      // An expiry shorter than the fresh window would skip the stale phase
      expire_after: expire_after.max(fresh_for),
    }
  }

  /// Classify data fetched at `fetched_at`. Never-fetched or invalidated
  /// data (`None`) is expired.
  pub fn classify(&self, fetched_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Freshness {
    let Some(fetched_at) = fetched_at else {
      return Freshness::Expired;
    };
    let age = age_of(fetched_at, now);
    if age < self.fresh_for {
      Freshness::Fresh
    } else if age < self.expire_after {
      Freshness::Stale
    } else {
      Freshness::Expired
    }
  }
}

impl Default for FreshnessPolicy {
  fn default() -> Self {
    Self::new(Duration::hours(1), Duration::hours(24))
  }
}

/// Default policy plus per-collection overrides.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
  default: FreshnessPolicy,
  overrides: HashMap<String, FreshnessPolicy>,
}

impl PolicySet {
  pub fn new(default: FreshnessPolicy) -> Self {
    Self {
      default,
      overrides: HashMap::new(),
    }
  }

  pub fn with_override(mut self, collection: impl Into<String>, policy: FreshnessPolicy) -> Self {
    self.overrides.insert(collection.into(), policy);
    self
  }

  pub fn for_collection(&self, collection: &str) -> FreshnessPolicy {
    self
      .overrides
      .get(collection)
      .copied()
      .unwrap_or(self.default)
  }

  /// Policy for a rendered key such as `customers_A`, when only the key
  /// string is known (persisted records).
  pub fn for_key(&self, key: &str) -> FreshnessPolicy {
    self
      .overrides
      .iter()
      .find(|(collection, _)| {
        key == collection.as_str()
          || key
            .strip_prefix(collection.as_str())
            .is_some_and(|rest| rest.starts_with('_'))
      })
      .map(|(_, policy)| *policy)
      .unwrap_or(self.default)
  }

  pub fn default_policy(&self) -> FreshnessPolicy {
    self.default
  }
}

/// Age of data, clamped at zero for clocks that moved backwards.
pub fn age_of(fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
  (now - fetched_at).max(Duration::zero())
}

/// Short human-readable age like "5m ago"
pub fn age_display(age: Duration) -> String {
  let minutes = age.num_minutes();
  if minutes < 1 {
    "just now".to_string()
  } else if minutes < 60 {
    format!("{}m ago", minutes)
  } else if minutes < 60 * 24 {
    format!("{}h ago", minutes / 60)
  } else {
    format!("{}d ago", minutes / (60 * 24))
  }
}
