//! Watch history: one row per video, bounded to the most recent views.

use tracing::{debug, error};

use crate::live::Subscription;
use crate::model::{HistoryEntry, HistoryRecord};
use crate::store::{Store, blocking};
use crate::sync::now_millis;

#[derive(Clone)]
pub struct HistoryLog {
  store: Store,
  limit: usize,
}

impl HistoryLog {
  /// `limit` is the number of views kept; older ones are pruned on every write.
  pub fn new(store: Store, limit: usize) -> Self {
    Self { store, limit: limit.max(1) }
  }

  /// Record that `video_id` was watched up to `position` seconds at `timestamp`
  /// (epoch millis). A repeat view replaces the earlier row.
  pub async fn record_view(&self, video_id: &str, position: u32, timestamp: i64) {
    let (store, limit, id) = (self.store.clone(), self.limit, video_id.to_string());
    let result = blocking(move || {
      store.record_history(HistoryEntry { video_id: &id, view_timestamp: timestamp, position }, limit)
    })
    .await;
    match result {
      Ok(pruned) => debug!(video_id, position, pruned, "history: view recorded"),
      Err(e) => error!(video_id, err = %e, "history: failed to record view"),
    }
  }

  pub async fn record_view_now(&self, video_id: &str, position: u32) {
    self.record_view(video_id, position, now_millis()).await;
  }

  /// Saved playback position, or 0 when the video was never watched.
  pub async fn find_by_video_id(&self, video_id: &str) -> u32 {
    let (store, id) = (self.store.clone(), video_id.to_string());
    match blocking(move || store.get_history(&id)).await {
      Ok(row) => row.map_or(0, |(_, position)| position),
      Err(e) => {
        error!(video_id, err = %e, "history: lookup failed");
        0
      }
    }
  }

  /// One-shot snapshot, newest view first.
  pub async fn history(&self) -> Vec<HistoryRecord> {
    let store = self.store.clone();
    blocking(move || store.history_newest_first()).await.unwrap_or_else(|e| {
      error!(err = %e, "history: snapshot failed");
      Vec::new()
    })
  }

  pub fn observe_history(&self) -> Subscription<HistoryRecord> {
    self.store.observe_history()
  }
}
