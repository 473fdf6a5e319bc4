//! Seam to the remote video platform. The engines only see this trait; the
//! YouTube Data API client in [`crate::youtube`] is the production implementation.

use async_trait::async_trait;

use crate::error::SyncResult;

/// Channel metadata as returned by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMeta {
  pub channel_id: String,
  pub title: String,
  pub thumbnail_url: Option<String>,
}

/// One item of a video listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVideo {
  pub video_id: String,
  pub title: String,
  pub thumbnail_url: Option<String>,
  /// Epoch millis.
  pub published_at: i64,
}

/// A page of a channel's videos, newest first. No `next_page_token` means last page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoPage {
  pub items: Vec<RemoteVideo>,
  pub next_page_token: Option<String>,
}

#[async_trait]
pub trait VideoSource: Send + Sync {
  /// Exact handle lookup. `Ok(None)` when nothing matches.
  async fn resolve_handle(&self, handle: &str) -> SyncResult<Option<String>>;

  async fn channel_metadata(&self, channel_id: &str) -> SyncResult<Option<ChannelMeta>>;

  /// One page of the channel's uploads of type video, ordered newest first.
  async fn list_videos(&self, channel_id: &str, page_token: Option<&str>) -> SyncResult<VideoPage>;
}

/// Handles are looked up with their leading `@`.
pub fn normalize_handle(handle: &str) -> String {
  let trimmed = handle.trim();
  if trimmed.starts_with('@') { trimmed.to_string() } else { format!("@{}", trimmed) }
}
