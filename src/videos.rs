//! Paginated fetch-and-merge of a channel's videos.
//!
//! Each channel has a persisted [`Cursor`]. Page requests for one channel never
//! overlap (a second request while one is in flight is dropped), and every
//! mutation of a channel's rows goes through that channel's lock, so a ban
//! commits before any later page response for the channel is applied.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::live::Subscription;
use crate::model::{Cursor, Video};
use crate::remote::VideoPage;
use crate::store::blocking;
use crate::sync::SyncContext;

/// What a page request ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// A page was fetched and merged.
  Stored { stored: usize, banned: usize, exhausted: bool },
  /// Pagination already finished for this channel; no request made.
  Exhausted,
  /// Cursor unset but videos are cached; no request made.
  AlreadyCached,
  /// Another request for this channel is running; this one was dropped.
  InFlight,
  /// The request failed; details went to the log (and the auth signal).
  Failed,
}

#[derive(Clone)]
pub struct VideoSync {
  ctx: SyncContext,
  pending: Arc<StdMutex<HashSet<String>>>,
  channel_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Marks a channel as having a request in flight until dropped, on every exit path.
struct PendingGuard {
  pending: Arc<StdMutex<HashSet<String>>>,
  channel_id: String,
}

impl PendingGuard {
  fn acquire(pending: &Arc<StdMutex<HashSet<String>>>, channel_id: &str) -> Option<Self> {
    if !lock(pending).insert(channel_id.to_string()) {
      return None;
    }
    Some(Self { pending: Arc::clone(pending), channel_id: channel_id.to_string() })
  }
}

impl Drop for PendingGuard {
  fn drop(&mut self) {
    lock(&self.pending).remove(&self.channel_id);
  }
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl VideoSync {
  pub fn new(ctx: SyncContext) -> Self {
    Self { ctx, pending: Arc::default(), channel_locks: Arc::default() }
  }

  /// Cached videos right away. When nothing is cached for the channel the
  /// first page is fetched in the background.
  pub fn observe_videos(&self, channel_id: &str) -> Subscription<Video> {
    let subscription = self.ctx.store.observe_videos(channel_id);
    let this = self.clone();
    let channel_id = channel_id.to_string();
    tokio::spawn(async move {
      let store = this.ctx.store.clone();
      let id = channel_id.clone();
      match blocking(move || store.count_videos_for_channel(&id)).await {
        Ok(0) => {
          this.fetch_next_page(&channel_id).await;
        }
        Ok(_) => {}
        Err(e) => this.ctx.report("observe_videos", &e),
      }
    });
    subscription
  }

  /// Fire-and-forget form of [`Self::fetch_next_page`] for scroll handlers.
  pub fn request_next_page(&self, channel_id: &str) {
    let this = self.clone();
    let channel_id = channel_id.to_string();
    tokio::spawn(async move {
      this.fetch_next_page(&channel_id).await;
    });
  }

  /// Continue pagination for `channel_id`. Safe to call repeatedly.
  pub async fn fetch_next_page(&self, channel_id: &str) -> FetchOutcome {
    let Some(_guard) = PendingGuard::acquire(&self.pending, channel_id) else {
      debug!(channel_id, "videos: page request already in flight, dropping");
      return FetchOutcome::InFlight;
    };
    match self.fetch_page(channel_id).await {
      Ok(outcome) => outcome,
      Err(e) => {
        self.ctx.report("fetch_next_page", &e);
        FetchOutcome::Failed
      }
    }
  }

  /// Drop the channel's cached videos and cursor, then fetch page one again.
  /// Bans still apply to the new series.
  pub async fn reload_channel(&self, channel_id: &str) -> FetchOutcome {
    let Some(_guard) = PendingGuard::acquire(&self.pending, channel_id) else {
      return FetchOutcome::InFlight;
    };

    let result = async {
      {
        let channel_lock = self.channel_lock(channel_id);
        let _serial = channel_lock.lock().await;
        let (store, id) = (self.ctx.store.clone(), channel_id.to_string());
        let cleared = blocking(move || store.reset_channel(&id)).await?;
        info!(channel_id, cleared, "videos: channel reset for reload");
      }
      self.fetch_page(channel_id).await
    }
    .await;

    result.unwrap_or_else(|e| {
      self.ctx.report("reload_channel", &e);
      FetchOutcome::Failed
    })
  }

  /// Remove a video and record the ban. Returns `false` when the video is not
  /// cached or the ban could not be recorded.
  pub async fn ban_video(&self, video_id: &str) -> bool {
    match self.try_ban(video_id).await {
      Ok(banned) => banned,
      Err(e) => {
        self.ctx.report("ban_video", &e);
        false
      }
    }
  }

  async fn try_ban(&self, video_id: &str) -> SyncResult<bool> {
    let store = self.ctx.store.clone();
    let id = video_id.to_string();
    let Some(video) = blocking(move || store.get_video(&id)).await? else {
      debug!(video_id, "videos: ban ignored, video not cached");
      return Ok(false);
    };

    let channel_lock = self.channel_lock(&video.channel_id);
    let _serial = channel_lock.lock().await;
    let (store, config) = (self.ctx.store.clone(), Arc::clone(&self.ctx.config));
    blocking(move || {
      config.ban_video(&video.video_id, &video.description)?;
      if let Err(e) = store.delete_video(&video.video_id) {
        warn!(video_id = %video.video_id, err = %e, "videos: ban recorded but row still cached until reload");
        return Err(e);
      }
      Ok(())
    })
    .await?;
    info!(video_id, "videos: banned");
    Ok(true)
  }

  async fn fetch_page(&self, channel_id: &str) -> SyncResult<FetchOutcome> {
    let (store, id) = (self.ctx.store.clone(), channel_id.to_string());
    let (cursor, cached) = blocking(move || Ok((store.cursor(&id)?, store.count_videos_for_channel(&id)?))).await?;

    let token = match cursor {
      Cursor::Exhausted => return Ok(FetchOutcome::Exhausted),
      Cursor::Unset if cached > 0 => return Ok(FetchOutcome::AlreadyCached),
      Cursor::Unset => None,
      Cursor::Set(token) => Some(token),
    };

    debug!(channel_id, token = ?token, "videos: requesting page");
    let page = self.ctx.source.list_videos(channel_id, token.as_deref()).await?;
    self.apply_page(channel_id, page).await
  }

  /// Merge a page under the channel lock. Bans are read here, after the lock,
  /// so a ban that committed while the request was in flight still applies.
  async fn apply_page(&self, channel_id: &str, page: VideoPage) -> SyncResult<FetchOutcome> {
    let channel_lock = self.channel_lock(channel_id);
    let _serial = channel_lock.lock().await;

    let (store, config) = (self.ctx.store.clone(), Arc::clone(&self.ctx.config));
    let id = channel_id.to_string();
    let outcome = blocking(move || {
      let mut rows = Vec::with_capacity(page.items.len());
      let mut banned = 0;
      for item in page.items {
        if config.is_banned(&item.video_id) {
          banned += 1;
          continue;
        }
        rows.push(Video {
          video_id: item.video_id,
          channel_id: id.clone(),
          description: item.title,
          thumbnail_url: item.thumbnail_url,
          fetched_at: item.published_at,
        });
      }
      let next = Cursor::after_page(page.next_page_token);
      store.store_page(&id, &rows, &next)?;
      Ok(FetchOutcome::Stored { stored: rows.len(), banned, exhausted: next == Cursor::Exhausted })
    })
    .await?;

    info!(channel_id, outcome = ?outcome, "videos: page stored");
    Ok(outcome)
  }

  fn channel_lock(&self, channel_id: &str) -> Arc<Mutex<()>> {
    Arc::clone(lock(&self.channel_locks).entry(channel_id.to_string()).or_default())
  }

  #[cfg(test)]
  fn is_pending(&self, channel_id: &str) -> bool {
    lock(&self.pending).contains(channel_id)
  }
}
