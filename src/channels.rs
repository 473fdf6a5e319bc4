//! Channel reconciliation: keeps the cached channel table in line with the
//! handles listed in the user's config.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::live::Subscription;
use crate::model::Channel;
use crate::store::blocking;
use crate::sync::{SyncContext, now_millis};

/// Counters from one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  /// Complete cached rows kept without a network call.
  pub kept: usize,
  pub fetched: usize,
  /// Handles that resolved to nothing.
  pub skipped: usize,
  pub failed: usize,
  pub removed: usize,
}

#[derive(Clone)]
pub struct ChannelSync {
  ctx: SyncContext,
  /// Reconciles run one at a time.
  serial: Arc<Mutex<()>>,
}

impl ChannelSync {
  pub fn new(ctx: SyncContext) -> Self {
    Self { ctx, serial: Arc::new(Mutex::new(())) }
  }

  /// Cached channels right away; a reconcile runs in the background and its
  /// result arrives as further snapshots.
  pub fn observe_channels(&self) -> Subscription<Channel> {
    let subscription = self.ctx.store.observe_channels();
    let this = self.clone();
    tokio::spawn(async move {
      this.reconcile().await;
    });
    subscription
  }

  /// Bring the channel table in line with the configured handles.
  pub async fn reconcile(&self) -> ReconcileReport {
    let _serial = self.serial.lock().await;
    let mut report = ReconcileReport::default();

    let handles = self.ctx.config.channel_handles();
    let store = self.ctx.store.clone();
    let cached = match blocking(move || store.channels()).await {
      Ok(cached) => cached,
      Err(e) => {
        self.ctx.report("reconcile", &e);
        return report;
      }
    };

    let mut removable: HashSet<String> = cached.iter().map(|c| c.channel_id.clone()).collect();
    let by_handle = index_by_handle(&cached);
    let mut staged = Vec::new();

    for handle in &handles {
      let cached_row = by_handle.get(handle.as_str()).copied();
      if let Some(row) = cached_row
        && row.is_complete()
      {
        removable.remove(&row.channel_id);
        report.kept += 1;
        continue;
      }

      match self.fetch_channel(handle, cached_row).await {
        Ok(Some(channel)) => {
          debug!(handle, channel_id = %channel.channel_id, "channels: fetched metadata");
          removable.remove(&channel.channel_id);
          staged.push(channel);
          report.fetched += 1;
        }
        Ok(None) => {
          warn!(handle, "channels: skipping handle with no discoverable channel");
          report.skipped += 1;
        }
        Err(e) => {
          // Keep whatever we had for this handle.
          if let Some(row) = cached_row {
            removable.remove(&row.channel_id);
          }
          self.ctx.report("reconcile", &e);
          report.failed += 1;
        }
      }
    }

    let removals: Vec<String> = removable.into_iter().collect();
    let store = self.ctx.store.clone();
    match blocking(move || {
      let removed = store.delete_channels(&removals)?;
      store.upsert_channels(&staged)?;
      Ok(removed)
    })
    .await
    {
      Ok(removed) => report.removed = removed,
      Err(e) => self.ctx.report("reconcile", &e),
    }

    info!(
      kept = report.kept,
      fetched = report.fetched,
      skipped = report.skipped,
      failed = report.failed,
      removed = report.removed,
      "channels: reconcile finished"
    );
    report
  }

  /// Resolve (reusing a stale row's id when there is one) and fetch metadata.
  async fn fetch_channel(&self, handle: &str, cached: Option<&Channel>) -> SyncResult<Option<Channel>> {
    let channel_id = match cached {
      Some(row) => row.channel_id.clone(),
      None => match self.ctx.source.resolve_handle(handle).await? {
        Some(id) => id,
        None => return Ok(None),
      },
    };

    let Some(meta) = self.ctx.source.channel_metadata(&channel_id).await? else {
      return Ok(None);
    };
    Ok(Some(Channel {
      channel_id: meta.channel_id,
      handle: handle.to_string(),
      title: meta.title,
      thumbnail_url: meta.thumbnail_url,
      fetched_at: now_millis(),
    }))
  }
}

/// Handles may collide; like the store lookup, the most recently fetched row wins.
fn index_by_handle(cached: &[Channel]) -> HashMap<&str, &Channel> {
  let mut by_handle: HashMap<&str, &Channel> = HashMap::new();
  for row in cached {
    by_handle
      .entry(row.handle.as_str())
      .and_modify(|current| {
        if row.fetched_at > current.fetched_at {
          *current = row;
        }
      })
      .or_insert(row);
  }
  by_handle
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::provider::{ConfigProvider, JsonConfigFile};
  use crate::remote::{ChannelMeta, VideoPage, VideoSource};
  use crate::store::Store;
  use crate::sync::SyncEvent;
  use async_trait::async_trait;
  use std::sync::Mutex as StdMutex;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct FakeSource {
    handles: HashMap<String, String>,
    metadata: HashMap<String, ChannelMeta>,
    failing: HashSet<String>,
    auth_failing: bool,
    calls: AtomicUsize,
    resolved: StdMutex<Vec<String>>,
  }

  impl FakeSource {
    fn with_channel(mut self, handle: &str, id: &str, title: &str, thumb: &str) -> Self {
      self.handles.insert(handle.into(), id.into());
      self.metadata.insert(
        id.into(),
        ChannelMeta { channel_id: id.into(), title: title.into(), thumbnail_url: Some(thumb.into()) },
      );
      self
    }
  }

  #[async_trait]
  impl VideoSource for FakeSource {
    async fn resolve_handle(&self, handle: &str) -> SyncResult<Option<String>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.resolved.lock().unwrap().push(handle.to_string());
      if self.auth_failing {
        return Err(SyncError::AuthRequired("401".into()));
      }
      Ok(self.handles.get(handle).cloned())
    }

    async fn channel_metadata(&self, channel_id: &str) -> SyncResult<Option<ChannelMeta>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.failing.contains(channel_id) {
        return Err(SyncError::Network("connection reset".into()));
      }
      Ok(self.metadata.get(channel_id).cloned())
    }

    async fn list_videos(&self, _channel_id: &str, _page_token: Option<&str>) -> SyncResult<VideoPage> {
      unreachable!("channel sync never lists videos")
    }
  }

  struct Harness {
    _dir: tempfile::TempDir,
    sync: ChannelSync,
    ctx: SyncContext,
    source: Arc<FakeSource>,
  }

  fn harness(handles: &[&str], source: FakeSource) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel_handles.json");
    let json = serde_json::json!({ "channel_handles": handles, "banned_video_ids": {} });
    std::fs::write(&path, json.to_string()).unwrap();
    let config: Arc<dyn ConfigProvider> = Arc::new(JsonConfigFile::open(&path).unwrap());
    let source = Arc::new(source);
    let ctx = SyncContext::new(Store::open_memory().unwrap(), config, source.clone());
    Harness { _dir: dir, sync: ChannelSync::new(ctx.clone()), ctx, source }
  }

  fn cached(id: &str, handle: &str, title: &str, thumb: Option<&str>) -> Channel {
    Channel {
      channel_id: id.into(),
      handle: handle.into(),
      title: title.into(),
      thumbnail_url: thumb.map(str::to_string),
      fetched_at: 1,
    }
  }

  #[tokio::test]
  async fn empty_cache_resolves_and_stores() {
    let h = harness(&["@alpha"], FakeSource::default().with_channel("@alpha", "UC1", "Alpha", "u1"));
    let report = h.sync.reconcile().await;
    assert_eq!(report.fetched, 1);

    let rows = h.ctx.store.channels().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].channel_id, "UC1");
    assert_eq!(rows[0].handle, "@alpha");
    assert_eq!(rows[0].title, "Alpha");
    assert_eq!(rows[0].thumbnail_url.as_deref(), Some("u1"));
  }

  #[tokio::test]
  async fn complete_rows_take_the_fast_path() {
    let h = harness(&["@alpha"], FakeSource::default());
    h.ctx.store.upsert_channels(&[cached("UC1", "@alpha", "Alpha", Some("u1"))]).unwrap();

    let report = h.sync.reconcile().await;
    assert_eq!(report, ReconcileReport { kept: 1, ..ReconcileReport::default() });
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.ctx.store.channels().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn incomplete_row_reuses_cached_id() {
    let source = FakeSource::default().with_channel("@unused", "UC1", "Alpha", "u1");
    let h = harness(&["@alpha"], source);
    h.ctx.store.upsert_channels(&[cached("UC1", "@alpha", "", None)]).unwrap();

    h.sync.reconcile().await;
    assert!(h.source.resolved.lock().unwrap().is_empty());
    assert_eq!(h.ctx.store.channels().unwrap()[0].title, "Alpha");
  }

  #[tokio::test]
  async fn undesired_handles_are_pruned() {
    let h = harness(&["@alpha"], FakeSource::default());
    h.ctx
      .store
      .upsert_channels(&[cached("UC1", "@alpha", "Alpha", Some("u1")), cached("UC2", "@gone", "Gone", Some("u2"))])
      .unwrap();

    let report = h.sync.reconcile().await;
    assert_eq!(report.removed, 1);
    let ids: Vec<_> = h.ctx.store.channels().unwrap().into_iter().map(|c| c.channel_id).collect();
    assert_eq!(ids, ["UC1"]);
  }

  #[tokio::test]
  async fn unknown_handle_is_skipped() {
    let h = harness(&["@nobody", "@alpha"], FakeSource::default().with_channel("@alpha", "UC1", "Alpha", "u1"));
    let report = h.sync.reconcile().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.fetched, 1);
    assert_eq!(h.ctx.store.channels().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn failure_keeps_existing_row_and_continues() {
    let mut source = FakeSource::default().with_channel("@beta", "UC2", "Beta", "u2");
    source.failing.insert("UC1".into());
    let h = harness(&["@alpha", "@beta"], source);
    h.ctx.store.upsert_channels(&[cached("UC1", "@alpha", "", None)]).unwrap();

    let report = h.sync.reconcile().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.fetched, 1);
    let rows = h.ctx.store.channels().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|c| c.channel_id == "UC1" && c.title.is_empty()));
  }

  #[tokio::test]
  async fn auth_failure_raises_event() {
    let source = FakeSource { auth_failing: true, ..FakeSource::default() };
    let h = harness(&["@alpha"], source);
    let mut events = h.ctx.subscribe_events();

    let report = h.sync.reconcile().await;
    assert_eq!(report.failed, 1);
    match events.try_recv().unwrap() {
      SyncEvent::AuthRequired { operation, .. } => assert_eq!(operation, "reconcile"),
    }
  }

  #[test]
  fn handle_index_prefers_newest_row() {
    let mut old = cached("UC1", "@alpha", "Old", Some("u"));
    old.fetched_at = 1;
    let mut new = cached("UC9", "@alpha", "New", Some("u"));
    new.fetched_at = 2;
    let rows = [new, old];
    assert_eq!(index_by_handle(&rows)["@alpha"].channel_id, "UC9");
  }
}
