use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::constants;
use crate::error::{SyncError, SyncResult};
use crate::remote::{ChannelMeta, RemoteVideo, VideoPage, VideoSource, normalize_handle};

/// How requests are authorized against the Data API.
#[derive(Debug, Clone)]
pub enum Auth {
  ApiKey(String),
  /// OAuth access token acquired by the outer application.
  Bearer(String),
}

/// YouTube Data API v3 client.
pub struct YoutubeClient {
  http: Client,
  base_url: String,
  auth: Auth,
}

impl YoutubeClient {
  pub fn new(auth: Auth) -> SyncResult<Self> {
    let http = Client::builder().timeout(Duration::from_secs(constants().request_timeout_secs)).build()?;
    Ok(Self { http, base_url: constants().api_base_url.clone(), auth })
  }

  async fn get<T: DeserializeOwned>(&self, endpoint: &str, params: &[(&str, &str)]) -> SyncResult<T> {
    let mut query: Vec<(&str, &str)> = params.to_vec();
    if let Auth::ApiKey(key) = &self.auth {
      query.push(("key", key.as_str()));
    }
    let url = Url::parse_with_params(&format!("{}/{}", self.base_url, endpoint), &query)
      .map_err(|e| SyncError::Network(format!("invalid API url: {}", e)))?;

    let mut request = self.http.get(url);
    if let Auth::Bearer(token) = &self.auth {
      request = request.bearer_auth(token);
    }

    debug!(endpoint, "youtube: request");
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_failure(endpoint, status, &body));
    }
    response.json::<T>().await.map_err(|e| SyncError::Malformed(format!("{}: {}", endpoint, e)))
  }
}

#[async_trait]
impl VideoSource for YoutubeClient {
  async fn resolve_handle(&self, handle: &str) -> SyncResult<Option<String>> {
    let handle = normalize_handle(handle);
    let response: ListResponse<ChannelItem> = self.get("channels", &[("part", "id"), ("forHandle", handle.as_str())]).await?;
    Ok(response.items.into_iter().next().map(|c| c.id))
  }

  async fn channel_metadata(&self, channel_id: &str) -> SyncResult<Option<ChannelMeta>> {
    let response: ListResponse<ChannelItem> = self.get("channels", &[("part", "snippet"), ("id", channel_id)]).await?;
    Ok(parse_channel_meta(response))
  }

  async fn list_videos(&self, channel_id: &str, page_token: Option<&str>) -> SyncResult<VideoPage> {
    let max_results = constants().page_size.to_string();
    let mut params = vec![
      ("part", "snippet"),
      ("channelId", channel_id),
      ("type", "video"),
      ("order", "date"),
      ("maxResults", max_results.as_str()),
    ];
    if let Some(token) = page_token {
      params.push(("pageToken", token));
    }
    let response: ListResponse<SearchItem> = self.get("search", &params).await?;
    Ok(parse_video_page(response))
  }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
  #[serde(default = "Vec::new")]
  items: Vec<T>,
  next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
  id: String,
  snippet: Option<ChannelSnippet>,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
  #[serde(default)]
  title: String,
  thumbnails: Option<Thumbnails>,
}

#[derive(Debug, Deserialize)]
struct Thumbnails {
  default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
  url: String,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
  id: SearchId,
  snippet: Option<SearchSnippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
  video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
  #[serde(default)]
  title: String,
  published_at: Option<String>,
  thumbnails: Option<Thumbnails>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
  error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
  #[serde(default)]
  message: String,
  #[serde(default)]
  errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
  #[serde(default)]
  reason: String,
}

/// Quota reasons come back as 403 but are not an authorization problem.
const QUOTA_REASONS: [&str; 3] = ["quotaExceeded", "rateLimitExceeded", "dailyLimitExceeded"];

fn classify_failure(endpoint: &str, status: StatusCode, body: &str) -> SyncError {
  let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
  let message = parsed.as_ref().map(|e| e.error.message.clone()).unwrap_or_default();
  let quota = parsed.as_ref().is_some_and(|e| e.error.errors.iter().any(|d| QUOTA_REASONS.contains(&d.reason.as_str())));

  match status {
    StatusCode::UNAUTHORIZED => SyncError::AuthRequired(format!("{} returned {}: {}", endpoint, status, message)),
    StatusCode::FORBIDDEN if !quota => {
      SyncError::AuthRequired(format!("{} returned {}: {}", endpoint, status, message))
    }
    _ => SyncError::Network(format!("{} returned {}: {}", endpoint, status, message)),
  }
}

fn parse_channel_meta(response: ListResponse<ChannelItem>) -> Option<ChannelMeta> {
  let item = response.items.into_iter().next()?;
  let snippet = item.snippet?;
  Some(ChannelMeta {
    channel_id: item.id,
    title: unescape_html(&snippet.title),
    thumbnail_url: snippet.thumbnails.and_then(|t| t.default).map(|t| t.url),
  })
}

fn parse_video_page(response: ListResponse<SearchItem>) -> VideoPage {
  let items = response
    .items
    .into_iter()
    .filter_map(|item| {
      let video_id = item.id.video_id.filter(|id| !id.is_empty())?;
      let snippet = item.snippet?;
      let published_at = match snippet.published_at.as_deref().map(chrono::DateTime::parse_from_rfc3339) {
        Some(Ok(at)) => at.timestamp_millis(),
        _ => {
          warn!(video_id = %video_id, "youtube: item without a valid publishedAt, skipping");
          return None;
        }
      };
      Some(RemoteVideo {
        video_id,
        title: unescape_html(&snippet.title),
        thumbnail_url: snippet.thumbnails.and_then(|t| t.default).map(|t| t.url),
        published_at,
      })
    })
    .collect();
  VideoPage { items, next_page_token: response.next_page_token.filter(|t| !t.is_empty()) }
}

/// Search snippets carry HTML-escaped titles, e.g. `Rock &amp; Roll` → `Rock & Roll`.
fn unescape_html(raw: &str) -> String {
  raw
    .replace("&quot;", "\"")
    .replace("&#39;", "'")
    .replace("&lt;", "<")
    .replace("&gt;", ">")
    .replace("&amp;", "&")
}
