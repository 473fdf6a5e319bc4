//! End-to-end runs of the cache against a scripted remote.

use async_trait::async_trait;
use chanplay::provider::{ConfigProvider, JsonConfigFile};
use chanplay::remote::{ChannelMeta, RemoteVideo, VideoPage, VideoSource};
use chanplay::store::Store;
use chanplay::videos::FetchOutcome;
use chanplay::{ChannelCache, Cursor, SyncContext, SyncError, SyncEvent, SyncResult};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct ScriptedRemote {
  handles: HashMap<String, String>,
  metadata: HashMap<String, ChannelMeta>,
  pages: Mutex<HashMap<Option<String>, VecDeque<SyncResult<VideoPage>>>>,
  requests: AtomicUsize,
}

impl ScriptedRemote {
  fn channel(mut self, handle: &str, id: &str, title: &str, thumb: &str) -> Self {
    self.handles.insert(handle.into(), id.into());
    let meta = ChannelMeta { channel_id: id.into(), title: title.into(), thumbnail_url: Some(thumb.into()) };
    self.metadata.insert(id.into(), meta);
    self
  }

  /// Queue a response for requests carrying `token` (None = first page).
  fn page(self, token: Option<&str>, response: SyncResult<VideoPage>) -> Self {
    self.pages.lock().unwrap().entry(token.map(str::to_string)).or_default().push_back(response);
    self
  }

  fn requests(&self) -> usize {
    self.requests.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl VideoSource for ScriptedRemote {
  async fn resolve_handle(&self, handle: &str) -> SyncResult<Option<String>> {
    self.requests.fetch_add(1, Ordering::SeqCst);
    Ok(self.handles.get(handle).cloned())
  }

  async fn channel_metadata(&self, channel_id: &str) -> SyncResult<Option<ChannelMeta>> {
    self.requests.fetch_add(1, Ordering::SeqCst);
    Ok(self.metadata.get(channel_id).cloned())
  }

  async fn list_videos(&self, _channel_id: &str, page_token: Option<&str>) -> SyncResult<VideoPage> {
    self.requests.fetch_add(1, Ordering::SeqCst);
    let mut pages = self.pages.lock().unwrap();
    pages
      .get_mut(&page_token.map(str::to_string))
      .and_then(VecDeque::pop_front)
      .unwrap_or_else(|| Err(SyncError::Network(format!("no scripted page for {:?}", page_token))))
  }
}

fn videos(ids: &[&str], next: Option<&str>) -> VideoPage {
  VideoPage {
    items: ids
      .iter()
      .enumerate()
      .map(|(i, id)| RemoteVideo {
        video_id: id.to_string(),
        title: format!("Video {}", id),
        thumbnail_url: None,
        published_at: 1_700_000_000_000 - i as i64,
      })
      .collect(),
    next_page_token: next.map(str::to_string),
  }
}

fn write_config(dir: &Path, handles: &[&str]) -> std::path::PathBuf {
  let path = dir.join("channel_handles.json");
  let json = serde_json::json!({ "channel_handles": handles, "banned_video_ids": {} });
  std::fs::write(&path, json.to_string()).unwrap();
  path
}

fn cache_with(dir: &Path, handles: &[&str], remote: Arc<ScriptedRemote>) -> ChannelCache {
  let config: Arc<dyn ConfigProvider> = Arc::new(JsonConfigFile::open(&write_config(dir, handles)).unwrap());
  let ctx = SyncContext::new(Store::open_memory().unwrap(), config, remote);
  ChannelCache::new(ctx, 10)
}

fn sorted_ids(cache: &ChannelCache, channel_id: &str) -> Vec<String> {
  let mut ids: Vec<_> =
    cache.context().store.videos_for_channel(channel_id).unwrap().into_iter().map(|v| v.video_id).collect();
  ids.sort();
  ids
}

#[tokio::test]
async fn first_run_resolves_configured_handle() {
  let dir = tempfile::tempdir().unwrap();
  let remote = Arc::new(ScriptedRemote::default().channel("@alpha", "UC1", "Alpha", "u1"));
  let cache = cache_with(dir.path(), &["@alpha"], remote.clone());

  let mut channels = cache.observe_channels();
  let rows = tokio::time::timeout(Duration::from_secs(5), channels.wait_for(|rows| !rows.is_empty()))
    .await
    .unwrap()
    .unwrap();

  assert_eq!(rows.len(), 1);
  let row = &rows[0];
  assert_eq!((row.channel_id.as_str(), row.handle.as_str(), row.title.as_str()), ("UC1", "@alpha", "Alpha"));
  assert_eq!(row.thumbnail_url.as_deref(), Some("u1"));

  // Second pass is served from the cache.
  let before = remote.requests();
  cache.reconcile().await;
  assert_eq!(remote.requests(), before);
}

#[tokio::test]
async fn pagination_runs_to_exhaustion() {
  let dir = tempfile::tempdir().unwrap();
  let remote = Arc::new(
    ScriptedRemote::default()
      .page(None, Ok(videos(&["v1", "v2"], Some("T1"))))
      .page(Some("T1"), Ok(videos(&["v3"], None))),
  );
  let cache = cache_with(dir.path(), &[], remote.clone());

  cache.fetch_next_page("UC1").await;
  assert_eq!(sorted_ids(&cache, "UC1"), ["v1", "v2"]);
  assert_eq!(cache.context().cursors.get("UC1").unwrap(), Cursor::Set("T1".into()));

  cache.fetch_next_page("UC1").await;
  assert_eq!(sorted_ids(&cache, "UC1"), ["v1", "v2", "v3"]);
  assert_eq!(cache.context().cursors.get("UC1").unwrap(), Cursor::Exhausted);

  let requests = remote.requests();
  assert_eq!(cache.fetch_next_page("UC1").await, FetchOutcome::Exhausted);
  assert_eq!(remote.requests(), requests);
  assert_eq!(sorted_ids(&cache, "UC1"), ["v1", "v2", "v3"]);
}

#[tokio::test]
async fn banned_video_stays_gone_after_refetch() {
  let dir = tempfile::tempdir().unwrap();
  let remote = Arc::new(
    ScriptedRemote::default()
      .page(None, Ok(videos(&["v1", "v2"], Some("T1"))))
      .page(Some("T1"), Ok(videos(&["v3"], None)))
      .page(None, Ok(videos(&["v1", "v2"], Some("T1")))),
  );
  let cache = cache_with(dir.path(), &[], remote);
  cache.fetch_next_page("UC1").await;
  cache.fetch_next_page("UC1").await;

  assert!(cache.ban_video("v2").await);
  let mut live = cache.observe_videos("UC1");
  let mut shown: Vec<_> = live.next().await.unwrap().into_iter().map(|v| v.video_id).collect();
  shown.sort();
  assert_eq!(shown, ["v1", "v3"]);

  // With rows cached and the cursor reset, page one is not requested again.
  cache.context().cursors.reset("UC1").unwrap();
  assert_eq!(cache.fetch_next_page("UC1").await, FetchOutcome::AlreadyCached);
  assert_eq!(sorted_ids(&cache, "UC1"), ["v1", "v3"]);

  // A full reload refetches page one; the ban still filters it.
  let outcome = cache.reload_channel("UC1").await;
  assert_eq!(outcome, FetchOutcome::Stored { stored: 1, banned: 1, exhausted: false });
  assert_eq!(sorted_ids(&cache, "UC1"), ["v1"]);

  let banned = cache.context().config.banned_videos();
  assert_eq!(banned.get("v2").map(String::as_str), Some("Video v2"));
}

#[tokio::test]
async fn ban_survives_restart_of_the_config_file() {
  let dir = tempfile::tempdir().unwrap();
  let remote = Arc::new(ScriptedRemote::default().page(None, Ok(videos(&["v1", "v2"], None))));
  let cache = cache_with(dir.path(), &[], remote);
  cache.fetch_next_page("UC1").await;
  assert!(cache.ban_video("v1").await);

  let reopened = JsonConfigFile::open(&dir.path().join("channel_handles.json")).unwrap();
  assert!(reopened.is_banned("v1"));
}

#[tokio::test]
async fn failed_fetch_can_be_retried() {
  let dir = tempfile::tempdir().unwrap();
  let remote = Arc::new(
    ScriptedRemote::default()
      .page(None, Err(SyncError::Network("connection reset".into())))
      .page(None, Ok(videos(&["v1"], None))),
  );
  let cache = cache_with(dir.path(), &[], remote.clone());

  assert_eq!(cache.fetch_next_page("UC1").await, FetchOutcome::Failed);
  assert!(sorted_ids(&cache, "UC1").is_empty());
  assert!(matches!(cache.fetch_next_page("UC1").await, FetchOutcome::Stored { stored: 1, .. }));
  assert_eq!(remote.requests(), 2);
}

#[tokio::test]
async fn auth_failure_is_surfaced_as_an_event() {
  let dir = tempfile::tempdir().unwrap();
  let remote = Arc::new(ScriptedRemote::default().page(None, Err(SyncError::AuthRequired("401".into()))));
  let cache = cache_with(dir.path(), &[], remote);
  let mut events = cache.subscribe_events();

  assert_eq!(cache.fetch_next_page("UC1").await, FetchOutcome::Failed);
  let SyncEvent::AuthRequired { operation, .. } = events.try_recv().unwrap();
  assert_eq!(operation, "fetch_next_page");
}

#[tokio::test]
async fn repeated_upserts_never_duplicate() {
  let dir = tempfile::tempdir().unwrap();
  let remote = Arc::new(
    ScriptedRemote::default()
      .page(None, Ok(videos(&["v1", "v2"], None)))
      .page(None, Ok(videos(&["v2", "v1"], None))),
  );
  let cache = cache_with(dir.path(), &[], remote);
  cache.fetch_next_page("UC1").await;
  cache.reload_channel("UC1").await;
  assert_eq!(sorted_ids(&cache, "UC1"), ["v1", "v2"]);
  assert_eq!(cache.context().store.count_videos_for_channel("UC1").unwrap(), 2);
}

#[tokio::test]
async fn history_keeps_newest_views_with_positions() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_with(dir.path(), &[], Arc::new(ScriptedRemote::default()));

  cache.record_view("v1", 10, 1).await;
  cache.record_view("v1", 20, 2).await;
  for i in 0..14 {
    cache.record_view(&format!("w{:02}", i), i, 100 + i as i64).await;
  }

  let history = cache.history().await;
  assert_eq!(history.len(), 10);
  assert_eq!(history[0].video_id, "w13");
  assert_eq!(history[9].video_id, "w04");
  assert_eq!(cache.find_by_video_id("v1").await, 0);
  assert_eq!(cache.find_by_video_id("w13").await, 13);
}
