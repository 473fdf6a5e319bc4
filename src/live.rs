//! Live queries: observers registered against the store receive a fresh,
//! fully-ordered snapshot every time a committed write touches their table.
//!
//! Snapshots are computed and sent from the store's delivery thread, never on
//! the writer's call stack. Dropping a [`Subscription`] unregisters it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak, mpsc as std_mpsc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{Channel, HistoryRecord, Video};

/// Tables whose writes trigger redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Table {
  Channels,
  Videos,
  History,
}

/// Work item for the delivery thread.
#[derive(Debug)]
pub(crate) enum Delivery {
  /// First snapshot for a freshly registered observer.
  Initial(u64),
  Changed(Table),
}

pub(crate) enum Observer {
  Channels(mpsc::UnboundedSender<Vec<Channel>>),
  Videos { channel_id: String, tx: mpsc::UnboundedSender<Vec<Video>> },
  History(mpsc::UnboundedSender<Vec<HistoryRecord>>),
}

impl Observer {
  /// History snapshots join against videos, so video writes refresh them too.
  pub(crate) fn watches(&self, table: Table) -> bool {
    match self {
      Observer::Channels(_) => table == Table::Channels,
      Observer::Videos { .. } => table == Table::Videos,
      Observer::History(_) => matches!(table, Table::History | Table::Videos),
    }
  }

  fn clone_sink(&self) -> Observer {
    match self {
      Observer::Channels(tx) => Observer::Channels(tx.clone()),
      Observer::Videos { channel_id, tx } => Observer::Videos { channel_id: channel_id.clone(), tx: tx.clone() },
      Observer::History(tx) => Observer::History(tx.clone()),
    }
  }
}

/// Observer registry owned by the store.
pub(crate) struct LiveRegistry {
  next_id: AtomicU64,
  observers: Mutex<HashMap<u64, Observer>>,
  queue: std_mpsc::Sender<Delivery>,
}

impl LiveRegistry {
  pub(crate) fn new(queue: std_mpsc::Sender<Delivery>) -> Self {
    Self { next_id: AtomicU64::new(1), observers: Mutex::new(HashMap::new()), queue }
  }

  pub(crate) fn subscribe_channels(self: &Arc<Self>) -> Subscription<Channel> {
    self.register(Observer::Channels)
  }

  pub(crate) fn subscribe_videos(self: &Arc<Self>, channel_id: &str) -> Subscription<Video> {
    let channel_id = channel_id.to_string();
    self.register(move |tx| Observer::Videos { channel_id, tx })
  }

  pub(crate) fn subscribe_history(self: &Arc<Self>) -> Subscription<HistoryRecord> {
    self.register(Observer::History)
  }

  fn register<T>(self: &Arc<Self>, make: impl FnOnce(mpsc::UnboundedSender<Vec<T>>) -> Observer) -> Subscription<T> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    self.lock().insert(id, make(tx));
    self.enqueue(Delivery::Initial(id));
    debug!(id, "live: observer registered");
    Subscription { id, rx, registry: Arc::downgrade(self) }
  }

  pub(crate) fn unsubscribe(&self, id: u64) {
    if self.lock().remove(&id).is_some() {
      debug!(id, "live: observer removed");
    }
  }

  /// Queue a redelivery for every observer of `table`.
  pub(crate) fn notify(&self, table: Table) {
    self.enqueue(Delivery::Changed(table));
  }

  fn enqueue(&self, delivery: Delivery) {
    if self.queue.send(delivery).is_err() {
      warn!("live: delivery thread is gone, snapshot dropped");
    }
  }

  /// Sinks of the observers affected by `delivery`, cloned so the lock is not
  /// held while snapshots are queried.
  pub(crate) fn targets(&self, delivery: &Delivery) -> Vec<(u64, Observer)> {
    let observers = self.lock();
    match delivery {
      Delivery::Initial(id) => observers.get(id).map(|o| (*id, o.clone_sink())).into_iter().collect(),
      Delivery::Changed(table) => {
        observers.iter().filter(|(_, o)| o.watches(*table)).map(|(id, o)| (*id, o.clone_sink())).collect()
      }
    }
  }

  #[cfg(test)]
  pub(crate) fn observer_count(&self) -> usize {
    self.lock().len()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Observer>> {
    // A panic while holding this lock leaves the map itself consistent.
    self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Handle to a live query. Each received item is the complete current result set.
pub struct Subscription<T> {
  id: u64,
  rx: mpsc::UnboundedReceiver<Vec<T>>,
  registry: Weak<LiveRegistry>,
}

impl<T> Subscription<T> {
  /// Wait for the next snapshot. `None` once the store is gone.
  pub async fn next(&mut self) -> Option<Vec<T>> {
    self.rx.recv().await
  }

  /// Wait until a snapshot satisfies `pred` and return it.
  pub async fn wait_for(&mut self, mut pred: impl FnMut(&[T]) -> bool) -> Option<Vec<T>> {
    while let Some(snapshot) = self.next().await {
      if pred(&snapshot) {
        return Some(snapshot);
      }
    }
    None
  }
}

impl<T> Drop for Subscription<T> {
  fn drop(&mut self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.unsubscribe(self.id);
    }
  }
}
