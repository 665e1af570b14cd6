//! Bounded exponential backoff around fetch functions.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::FetchError;
use crate::network::NetworkMonitor;

/// Progress through one retry chain.
///
/// Each failure produces a new state; nothing is shared between chains, so
/// overlapping retries for the same key cannot disturb each other's counters.
#[derive(Debug, Clone)]
struct RetryState {
  attempt: u32,
  last_error: Option<FetchError>,
}

impl RetryState {
  fn initial() -> Self {
    Self {
      attempt: 0,
      last_error: None,
    }
  }

  fn failed(self, error: FetchError) -> Self {
    Self {
      attempt: self.attempt + 1,
      last_error: Some(error),
    }
  }
}

/// Retry policy for fetch functions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  max_attempts: u32,
  base_delay: Duration,
  max_delay: Duration,
  network: Option<NetworkMonitor>,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      base_delay,
      max_delay: Duration::from_secs(30),
      network: None,
    }
  }

  /// A policy that makes exactly one attempt
  pub fn none() -> Self {
    Self::new(1, Duration::ZERO)
  }

  pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
    self.max_delay = max_delay;
    self
  }

  /// Consult this monitor before each attempt and between attempts.
  pub fn with_network(mut self, network: NetworkMonitor) -> Self {
    self.network = Some(network);
    self
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  /// Delay after the failure of attempt number `attempt` (zero based):
  /// `base_delay * 2^attempt`, doubled on slow connections, capped.
  pub fn delay_for(&self, attempt: u32, slow_connection: bool) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let mut delay = self.base_delay.saturating_mul(factor);
    if slow_connection {
      delay = delay.saturating_mul(2);
    }
    delay.min(self.max_delay)
  }

  fn is_offline(&self) -> bool {
    self.network.as_ref().is_some_and(|n| !n.is_online())
  }

  fn is_slow(&self) -> bool {
    self
      .network
      .as_ref()
      .is_some_and(|n| n.status().connection.is_slow())
  }

  /// Run `op` until it succeeds, fails fatally, or attempts run out.
  ///
  /// Exhausting attempts returns the last error. A known-offline device
  /// short-circuits with `NetworkUnavailable` instead of sleeping through
  /// the backoff ladder.
  pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
  {
    let mut state = RetryState::initial();

    loop {
      if self.is_offline() {
        debug!(attempt = state.attempt, "Skipping fetch, device is offline");
        return Err(FetchError::NetworkUnavailable);
      }

      let error = match op().await {
        Ok(value) => {
          if state.attempt > 0 {
            debug!(attempts = state.attempt + 1, "Fetch succeeded after retry");
          }
          return Ok(value);
        }
        Err(error) => error,
      };

      if !error.is_retryable() {
        return Err(error);
      }

      let failed_attempt = state.attempt;
      state = state.failed(error);

      if state.attempt >= self.max_attempts {
        let last = state.last_error.unwrap_or(FetchError::NetworkUnavailable);
        warn!(attempts = state.attempt, error = %last, "Giving up after retries");
        return Err(last);
      }

      if self.is_offline() {
        return Err(FetchError::NetworkUnavailable);
      }

      let delay = self.delay_for(failed_attempt, self.is_slow());
      debug!(
        attempt = state.attempt,
        delay_ms = delay.as_millis() as u64,
        "Retrying transient failure"
      );
      tokio::time::sleep(delay).await;
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_millis(500))
  }
}
