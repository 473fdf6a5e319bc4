//! The surface the presentation layer talks to: one value bundling the
//! channel, video and history engines over shared stores.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::channels::{ChannelSync, ReconcileReport};
use crate::config::Prefs;
use crate::history::HistoryLog;
use crate::live::Subscription;
use crate::model::{Channel, HistoryRecord, Video};
use crate::provider::{ConfigProvider, JsonConfigFile};
use crate::remote::VideoSource;
use crate::store::Store;
use crate::sync::{SyncContext, SyncEvent};
use crate::videos::{FetchOutcome, VideoSync};

#[derive(Clone)]
pub struct ChannelCache {
  ctx: SyncContext,
  channels: ChannelSync,
  videos: VideoSync,
  history: HistoryLog,
}

impl ChannelCache {
  pub fn new(ctx: SyncContext, history_limit: usize) -> Self {
    Self {
      channels: ChannelSync::new(ctx.clone()),
      videos: VideoSync::new(ctx.clone()),
      history: HistoryLog::new(ctx.store.clone(), history_limit),
      ctx,
    }
  }

  /// Open the on-disk stores and channel file named by `prefs`.
  pub fn open(prefs: &Prefs, source: Arc<dyn VideoSource>) -> Result<Self> {
    let db_path = prefs.database_path().context("No data directory for the database")?;
    let channels_path = prefs.channels_path().context("No config directory for the channel file")?;

    let store = Store::open(&db_path).with_context(|| format!("Failed to open {}", db_path.display()))?;
    let config: Arc<dyn ConfigProvider> = Arc::new(
      JsonConfigFile::open(&channels_path).with_context(|| format!("Failed to load {}", channels_path.display()))?,
    );

    Ok(Self::new(SyncContext::new(store, config, source), prefs.history_limit()))
  }

  pub fn context(&self) -> &SyncContext {
    &self.ctx
  }

  /// Auth prompts raised by background work.
  pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
    self.ctx.subscribe_events()
  }

  // --- Channels ---

  pub fn observe_channels(&self) -> Subscription<Channel> {
    self.channels.observe_channels()
  }

  pub async fn reconcile(&self) -> ReconcileReport {
    self.channels.reconcile().await
  }

  // --- Videos ---

  pub fn observe_videos(&self, channel_id: &str) -> Subscription<Video> {
    self.videos.observe_videos(channel_id)
  }

  pub async fn fetch_next_page(&self, channel_id: &str) -> FetchOutcome {
    self.videos.fetch_next_page(channel_id).await
  }

  pub fn request_next_page(&self, channel_id: &str) {
    self.videos.request_next_page(channel_id);
  }

  pub async fn reload_channel(&self, channel_id: &str) -> FetchOutcome {
    self.videos.reload_channel(channel_id).await
  }

  pub async fn ban_video(&self, video_id: &str) -> bool {
    self.videos.ban_video(video_id).await
  }

  // --- History ---

  pub fn observe_history(&self) -> Subscription<HistoryRecord> {
    self.history.observe_history()
  }

  pub async fn history(&self) -> Vec<HistoryRecord> {
    self.history.history().await
  }

  pub async fn record_view(&self, video_id: &str, position: u32, timestamp: i64) {
    self.history.record_view(video_id, position, timestamp).await;
  }

  pub async fn record_view_now(&self, video_id: &str, position: u32) {
    self.history.record_view_now(video_id, position).await;
  }

  pub async fn find_by_video_id(&self, video_id: &str) -> u32 {
    self.history.find_by_video_id(video_id).await
  }
}
