//! Error types for remote fetches and durable persistence.

use std::time::Duration;

use thiserror::Error;

/// Maximum length for response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Message fragments that identify protocol-level network failures
/// (connection drops, DNS failures, socket resets) as opposed to
/// server-side rejections.
const NETWORK_ERROR_MARKERS: &[&str] = &[
  "network",
  "failed to fetch",
  "err_connection",
  "err_name_not_resolved",
  "err_internet_disconnected",
  "connection refused",
  "connection reset",
  "connection closed",
  "connection terminated",
  "connection lost",
  "socket hang up",
  "socket closed",
  "econnreset",
  "epipe",
  "timed out",
  "timeout",
];

/// Why a fetch failed, classified for retry decisions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The device is known to be offline; nothing was sent.
  #[error("Network unavailable: device is offline")]
  NetworkUnavailable,

  /// Retry-eligible failure: 5xx, 503, request timeout or a dropped connection.
  #[error("Transient failure{}: {message}", status_suffix(.status))]
  Transient {
    status: Option<u16>,
    message: String,
  },

  /// The whole fetch chain exceeded its hard ceiling.
  #[error("Fetch timed out after {}s", .0.as_secs())]
  Timeout(Duration),

  /// Not retried: validation, auth, other 4xx, malformed responses.
  #[error("Request failed{}: {message}", status_suffix(.status))]
  Fatal {
    status: Option<u16>,
    message: String,
  },
}

fn status_suffix(status: &Option<u16>) -> String {
  match status {
    Some(code) => format!(" (HTTP {})", code),
    None => String::new(),
  }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
  if body.len() <= MAX_ERROR_BODY_LENGTH {
    return body.to_string();
  }
  let mut end = MAX_ERROR_BODY_LENGTH;
  while !body.is_char_boundary(end) {
    end -= 1;
  }
  format!(
    "{}... (truncated, {} total bytes)",
    &body[..end],
    body.len()
  )
}

impl FetchError {
  pub fn transient(message: impl Into<String>) -> Self {
    FetchError::Transient {
      status: None,
      message: message.into(),
    }
  }

  pub fn fatal(message: impl Into<String>) -> Self {
    FetchError::Fatal {
      status: None,
      message: message.into(),
    }
  }

  /// Classify an HTTP failure status.
  ///
  /// 5xx (including 503) and 408 are transient; every other status is fatal.
  pub fn from_status(status: u16, body: &str) -> Self {
    let message = truncate_body(body);
    match status {
      408 | 500..=599 => FetchError::Transient {
        status: Some(status),
        message,
      },
      _ => FetchError::Fatal {
        status: Some(status),
        message,
      },
    }
  }

  /// Classify an untyped error message from a fetch function.
  ///
  /// Messages that look like connection or timeout failures are transient,
  /// everything else is fatal.
  pub fn from_message(message: impl Into<String>) -> Self {
    let message = message.into();
    let lower = message.to_lowercase();
    if lower.contains("503") || lower.contains("service unavailable") {
      return FetchError::Transient {
        status: Some(503),
        message,
      };
    }
    if NETWORK_ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
      FetchError::transient(message)
    } else {
      FetchError::fatal(message)
    }
  }

  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      FetchError::NetworkUnavailable | FetchError::Transient { .. }
    )
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      FetchError::Transient { status, .. } | FetchError::Fatal { status, .. } => *status,
      _ => None,
    }
  }

  /// Human-readable text for an error indicator next to last-known data.
  ///
  /// Transient classes get their own wording so the UI can tell a flaky
  /// connection apart from a request that will never succeed.
  pub fn user_message(&self) -> String {
    match self {
      FetchError::NetworkUnavailable => {
        "You are offline. Showing saved data where available.".to_string()
      }
      FetchError::Transient {
        status: Some(503), ..
      } => "Service temporarily unavailable (503). Please retry shortly.".to_string(),
      FetchError::Transient { message, .. } => {
        format!("Connection problem, please retry: {}", message)
      }
      FetchError::Timeout(_) => "The server took too long to respond. Please retry.".to_string(),
      FetchError::Fatal { message, .. } => message.clone(),
    }
  }
}

/// Durable store failures.
#[derive(Error, Debug)]
pub enum StoreError {
  /// The write does not fit in the configured capacity.
  #[error("Storage quota exceeded: {needed} bytes needed, capacity is {capacity} bytes")]
  QuotaExceeded { needed: u64, capacity: u64 },

  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Invalid stored timestamp '{0}'")]
  Timestamp(String),

  #[error("Storage lock poisoned")]
  Poisoned,
}

impl StoreError {
  pub fn is_quota(&self) -> bool {
    matches!(self, StoreError::QuotaExceeded { .. })
  }
}
