use serde::{Deserialize, Serialize};

/// A cached channel. `channel_id` is the stable key; `handle` is only an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
  pub channel_id: String,
  pub handle: String,
  pub title: String,
  pub thumbnail_url: Option<String>,
  /// Epoch millis of the metadata fetch.
  pub fetched_at: i64,
}

impl Channel {
  /// A row with a title and a thumbnail needs no refresh during reconcile.
  pub fn is_complete(&self) -> bool {
    !self.title.is_empty() && self.thumbnail_url.is_some()
  }
}

/// A cached video of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
  pub video_id: String,
  pub channel_id: String,
  /// Display title.
  pub description: String,
  pub thumbnail_url: Option<String>,
  /// Epoch millis of the upstream publish time; drives list ordering.
  pub fetched_at: i64,
}

/// One row of the watch history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry<'a> {
  pub video_id: &'a str,
  /// Epoch millis of the last view.
  pub view_timestamp: i64,
  /// Playback offset in seconds.
  pub position: u32,
}

/// A history row joined with whatever the video table still knows about it.
///
/// `video` is `None` once the video has been banned or evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
  pub video_id: String,
  pub view_timestamp: i64,
  pub position: u32,
  pub video: Option<Video>,
}

impl HistoryRecord {
  /// Title for display, falling back to the bare id.
  pub fn title(&self) -> &str {
    self.video.as_ref().map_or(self.video_id.as_str(), |v| v.description.as_str())
  }
}

/// Pagination state of one channel's video listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Cursor {
  /// Never fetched.
  #[default]
  Unset,
  /// More pages exist; holds the continuation token.
  Set(String),
  /// Last page reached. Persisted as the empty string.
  Exhausted,
}

impl Cursor {
  /// Decode the persisted column: missing row is `Unset`, empty string is `Exhausted`.
  pub fn from_stored(value: Option<String>) -> Self {
    match value {
      None => Cursor::Unset,
      Some(token) if token.is_empty() => Cursor::Exhausted,
      Some(token) => Cursor::Set(token),
    }
  }

  /// The value written to storage, `None` meaning "delete the row".
  pub fn to_stored(&self) -> Option<&str> {
    match self {
      Cursor::Unset => None,
      Cursor::Set(token) => Some(token.as_str()),
      Cursor::Exhausted => Some(""),
    }
  }

  /// Cursor to persist after a page came back with `next_page_token`.
  pub fn after_page(next_page_token: Option<String>) -> Self {
    match next_page_token {
      Some(token) if !token.is_empty() => Cursor::Set(token),
      _ => Cursor::Exhausted,
    }
  }
}
