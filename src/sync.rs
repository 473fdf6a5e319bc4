use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::cursor::CursorStore;
use crate::error::SyncError;
use crate::provider::ConfigProvider;
use crate::remote::VideoSource;
use crate::store::Store;

/// Signals the presentation layer has to act on. Everything else stays in the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// The remote wants fresh user authorization. `operation` was abandoned and
  /// must be re-invoked once authorization succeeds.
  AuthRequired { operation: String, message: String },
}

/// Collaborators shared by every engine, injected at construction.
#[derive(Clone)]
pub struct SyncContext {
  pub store: Store,
  pub cursors: CursorStore,
  pub config: Arc<dyn ConfigProvider>,
  pub source: Arc<dyn VideoSource>,
  events: broadcast::Sender<SyncEvent>,
}

impl SyncContext {
  pub fn new(store: Store, config: Arc<dyn ConfigProvider>, source: Arc<dyn VideoSource>) -> Self {
    let (events, _) = broadcast::channel(16);
    Self { cursors: CursorStore::new(&store), store, config, source, events }
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  /// Log a failure absorbed at the engine boundary, raising the auth signal when needed.
  pub(crate) fn report(&self, operation: &str, err: &SyncError) {
    match err {
      SyncError::AuthRequired(message) => {
        warn!(operation, err = %err, "sync: authorization required");
        // No receivers just means nobody is listening for prompts yet.
        let _ = self.events.send(SyncEvent::AuthRequired { operation: operation.to_string(), message: message.clone() });
      }
      SyncError::Storage(_) | SyncError::Task(_) => error!(operation, err = %err, "sync: local failure"),
      _ => warn!(operation, err = %err, "sync: operation failed"),
    }
  }
}

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> i64 {
  chrono::Utc::now().timestamp_millis()
}
