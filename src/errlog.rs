//! Bounded journal of cache failures for diagnostics.
//!
//! Every failure the cache swallows or surfaces is recorded here with the
//! site it happened at, so a status screen can show what went wrong even
//! when the UI kept displaying last-known data.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{FetchError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
  Network,
  Storage,
  Sync,
  Validation,
  Logical,
}

impl ErrorType {
  /// Guess the error type from free-form message text.
  pub fn detect(message: &str) -> Self {
    let lower = message.to_lowercase();
    if lower.contains("network") || lower.contains("fetch") || lower.contains("offline") {
      ErrorType::Network
    } else if lower.contains("quota") || lower.contains("storage") || lower.contains("sqlite") {
      ErrorType::Storage
    } else if lower.contains("sync") {
      ErrorType::Sync
    } else if lower.contains("validation") || lower.contains("invalid") {
      ErrorType::Validation
    } else {
      ErrorType::Logical
    }
  }
}

impl From<&FetchError> for ErrorType {
  fn from(err: &FetchError) -> Self {
    match err {
      FetchError::NetworkUnavailable | FetchError::Transient { .. } | FetchError::Timeout(_) => {
        ErrorType::Network
      }
      FetchError::Fatal {
        status: Some(400 | 422),
        ..
      } => ErrorType::Validation,
      FetchError::Fatal { message, .. } => ErrorType::detect(message),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

impl Severity {
  pub fn detect(message: &str) -> Self {
    let lower = message.to_lowercase();
    if lower.contains("critical") || lower.contains("fatal") {
      Severity::Critical
    } else if lower.contains("quota exceeded") || lower.contains("sync failed") {
      Severity::High
    } else if lower.contains("warning") || lower.contains("retry") {
      Severity::Low
    } else {
      Severity::Medium
    }
  }
}

/// Where in the cache an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Site {
  pub module: &'static str,
  pub function: &'static str,
  pub operation: &'static str,
}

impl Site {
  pub const fn new(module: &'static str, function: &'static str, operation: &'static str) -> Self {
    Self {
      module,
      function,
      operation,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheErrorRecord {
  pub id: u64,
  pub timestamp: DateTime<Utc>,
  pub site: Site,
  pub key: Option<String>,
  pub error_type: ErrorType,
  pub severity: Severity,
  pub message: String,
  pub online: bool,
  pub resolved: bool,
}

/// Filter for [`ErrorLog::recent`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
  pub module: Option<&'static str>,
  pub key: Option<String>,
  pub error_type: Option<ErrorType>,
  pub min_severity: Option<Severity>,
  pub unresolved_only: bool,
  pub limit: Option<usize>,
}

struct LogInner {
  next_id: u64,
  records: VecDeque<CacheErrorRecord>,
}

pub struct ErrorLog {
  inner: Mutex<LogInner>,
  capacity: usize,
  retention: Duration,
}

impl ErrorLog {
  pub fn new(capacity: usize, retention: Duration) -> Self {
    Self {
      inner: Mutex::new(LogInner {
        next_id: 1,
        records: VecDeque::new(),
      }),
      capacity: capacity.max(1),
      retention,
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
    self
      .inner
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
  }

  /// Record an error and return its id.
  pub fn record(
    &self,
    site: Site,
    key: Option<&str>,
    error_type: ErrorType,
    severity: Severity,
    message: impl Into<String>,
    online: bool,
  ) -> u64 {
    let message = message.into();
    match severity {
      Severity::Critical | Severity::High => {
        error!(module = site.module, function = site.function, key, %message, "Cache error")
      }
      Severity::Medium => {
        warn!(module = site.module, function = site.function, key, %message, "Cache error")
      }
      Severity::Low => {
        info!(module = site.module, function = site.function, key, %message, "Cache error")
      }
    }

    let now = Utc::now();
    let mut inner = self.lock();
    let id = inner.next_id;
    inner.next_id += 1;
    inner.records.push_back(CacheErrorRecord {
      id,
      timestamp: now,
      site,
      key: key.map(String::from),
      error_type,
      severity,
      message,
      online,
      resolved: false,
    });

    // Opportunistic cleanup on every insert
    let cutoff = now - self.retention;
    while inner
      .records
      .front()
      .is_some_and(|r| r.timestamp < cutoff || inner.records.len() > self.capacity)
    {
      inner.records.pop_front();
    }

    id
  }

  pub fn record_fetch(&self, site: Site, key: &str, err: &FetchError, online: bool) -> u64 {
    let severity = match err {
      FetchError::Fatal { .. } => Severity::High,
      FetchError::NetworkUnavailable => Severity::Low,
      _ => Severity::Medium,
    };
    self.record(site, Some(key), err.into(), severity, err.to_string(), online)
  }

  pub fn record_store(&self, site: Site, key: Option<&str>, err: &StoreError, online: bool) -> u64 {
    let message = err.to_string();
    let severity = if err.is_quota() {
      Severity::High
    } else {
      Severity::detect(&message)
    };
    self.record(site, key, ErrorType::Storage, severity, message, online)
  }

  /// Matching records, newest first.
  pub fn recent(&self, filter: &LogFilter) -> Vec<CacheErrorRecord> {
    let inner = self.lock();
    let matches = inner
      .records
      .iter()
      .rev()
      .filter(|r| filter.module.map_or(true, |m| r.site.module == m))
      .filter(|r| filter.key.as_deref().map_or(true, |k| r.key.as_deref() == Some(k)))
      .filter(|r| filter.error_type.map_or(true, |t| r.error_type == t))
      .filter(|r| filter.min_severity.map_or(true, |s| r.severity >= s))
      .filter(|r| !filter.unresolved_only || !r.resolved)
      .cloned();
    match filter.limit {
      Some(limit) => matches.take(limit).collect(),
      None => matches.collect(),
    }
  }

  pub fn mark_resolved(&self, id: u64) -> bool {
    let mut inner = self.lock();
    match inner.records.iter_mut().find(|r| r.id == id) {
      Some(record) => {
        record.resolved = true;
        true
      }
      None => false,
    }
  }

  pub fn len(&self) -> usize {
    self.lock().records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn clear(&self) {
    self.lock().records.clear();
  }
}

impl Default for ErrorLog {
  fn default() -> Self {
    Self::new(1000, Duration::days(90))
  }
}
