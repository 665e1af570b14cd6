//! Ordered, fire-and-forget writes to the durable store.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::storage::{DurableStore, PersistedRecord};
use crate::error::StoreError;

enum StoreOp {
  Save(PersistedRecord),
  Remove(String),
  Clear,
  Flush(oneshot::Sender<()>),
}

/// What happened to one queued write.
pub struct WriteReport {
  pub op: &'static str,
  pub key: Option<String>,
  pub result: Result<(), StoreError>,
}

/// Handle to the single task that applies store writes in submission order.
#[derive(Clone)]
pub struct StoreWriter {
  tx: mpsc::UnboundedSender<StoreOp>,
}

impl StoreWriter {
  /// Spawn the writer task. Must be called inside a tokio runtime; the task
  /// ends once every handle is dropped.
  pub fn spawn<R>(store: Arc<dyn DurableStore>, report: R) -> Self
  where
    R: Fn(WriteReport) + Send + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
      while let Some(op) = rx.recv().await {
        let report_for = |op: &'static str, key: Option<String>, result| {
          report(WriteReport { op, key, result })
        };
        match op {
          StoreOp::Save(record) => {
            let key = record.key.clone();
            report_for("save", Some(key), store.save(&record));
          }
          StoreOp::Remove(key) => {
            let result = store.remove(&key);
            report_for("remove", Some(key), result);
          }
          StoreOp::Clear => report_for("clear", None, store.clear()),
          StoreOp::Flush(done) => {
            let _ = done.send(());
          }
        }
      }
      debug!("Store writer stopped");
    });
    Self { tx }
  }

  fn send(&self, op: StoreOp) {
    if self.tx.send(op).is_err() {
      debug!("Store writer is gone, dropping write");
    }
  }

  pub fn save(&self, record: PersistedRecord) {
    self.send(StoreOp::Save(record));
  }

  pub fn remove(&self, key: impl Into<String>) {
    self.send(StoreOp::Remove(key.into()));
  }

  pub fn clear(&self) {
    self.send(StoreOp::Clear);
  }

  /// Wait until every write queued before this call has been applied.
  pub async fn flush(&self) {
    let (done, wait) = oneshot::channel();
    self.send(StoreOp::Flush(done));
    let _ = wait.await;
  }
}
