use tokio::sync::broadcast;
use tracing::warn;

use crate::network::ConnectionType;

/// Process-wide context signals that affect cached data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// The active branch changed; branch-scoped data must be reloaded
  BranchSwitched { branch_id: String },
  /// The session ended; everything cached belongs to someone else now
  LoggedOut,
  /// A write elsewhere made a key (or, with `None`, everything) outdated
  DataSynced { key: Option<String> },
  /// Connectivity came back
  Online,
  /// Connectivity was lost
  Offline,
  /// The connection type hint changed
  ConnectionChanged(ConnectionType),
  /// The app regained focus or visibility
  Foreground,
}

/// Broadcast channel that decouples invalidation from whoever triggers it.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  /// Publish an event, returning how many listeners received it.
  pub fn publish(&self, event: CacheEvent) -> usize {
    // No listeners is not an error for a broadcast signal
    self.tx.send(event).unwrap_or(0)
  }

  /// Create a new listener that sees every event published from now on
  pub fn subscribe(&self) -> EventHandler {
    EventHandler {
      rx: self.tx.subscribe(),
    }
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}

/// Receiving end of the event bus
pub struct EventHandler {
  rx: broadcast::Receiver<CacheEvent>,
}

impl EventHandler {
  /// Receive the next event, or `None` once the bus is gone
  pub async fn next(&mut self) -> Option<CacheEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "Event listener lagged behind, dropped events");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_every_listener_sees_event() {
    let bus = EventBus::default();
    let mut a = bus.subscribe();
    let mut b = bus.subscribe();

    assert_eq!(bus.publish(CacheEvent::LoggedOut), 2);
    assert_eq!(a.next().await, Some(CacheEvent::LoggedOut));
    assert_eq!(b.next().await, Some(CacheEvent::LoggedOut));
  }

  #[tokio::test]
  async fn test_publish_without_listeners() {
    let bus = EventBus::default();
    assert_eq!(bus.publish(CacheEvent::Online), 0);
  }

  #[tokio::test]
  async fn test_closed_bus_ends_stream() {
    let bus = EventBus::default();
    let mut handler = bus.subscribe();
    drop(bus);
    assert_eq!(handler.next().await, None);
  }
}
