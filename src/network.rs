//! Ambient network-quality signal consulted by the retry policy.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::event::{CacheEvent, EventBus};

/// Connection type hint, as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
  #[default]
  Unknown,
  Ethernet,
  Wifi,
  #[serde(rename = "4g")]
  Cellular4g,
  #[serde(rename = "3g")]
  Cellular3g,
  #[serde(rename = "2g")]
  Cellular2g,
  #[serde(rename = "slow-2g")]
  Slow2g,
}

impl ConnectionType {
  /// Connections where backoff should be stretched
  pub fn is_slow(self) -> bool {
    matches!(self, ConnectionType::Cellular2g | ConnectionType::Slow2g)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
  pub online: bool,
  pub connection: ConnectionType,
}

impl Default for NetworkStatus {
  fn default() -> Self {
    Self {
      online: true,
      connection: ConnectionType::Unknown,
    }
  }
}

/// Shared, observable network status.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
  tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(NetworkStatus::default());
    Self { tx: Arc::new(tx) }
  }

  pub fn status(&self) -> NetworkStatus {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.status().online
  }

  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|status| {
      if status.online == online {
        return false;
      }
      status.online = online;
      true
    });
    if changed {
      info!(online, "Network status changed");
    }
  }

  pub fn set_connection(&self, connection: ConnectionType) {
    self.tx.send_if_modified(|status| {
      if status.connection == connection {
        return false;
      }
      status.connection = connection;
      true
    });
  }

  /// Observe status changes
  pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
    self.tx.subscribe()
  }

  /// Follow online/offline and connection events from the bus.
  pub fn attach(&self, bus: &EventBus) -> JoinHandle<()> {
    let monitor = self.clone();
    let mut events = bus.subscribe();
    tokio::spawn(async move {
      while let Some(event) = events.next().await {
        match event {
          CacheEvent::Online => monitor.set_online(true),
          CacheEvent::Offline => monitor.set_online(false),
          CacheEvent::ConnectionChanged(connection) => monitor.set_connection(connection),
          _ => {}
        }
      }
    })
  }
}

impl Default for NetworkMonitor {
  fn default() -> Self {
    Self::new()
  }
}
