use thiserror::Error;

/// Failures produced by the store, the remote source and the config provider.
///
/// Engines absorb these at the observe/trigger boundary; only
/// [`SyncError::AuthRequired`] is surfaced to the presentation layer, as a
/// [`crate::sync::SyncEvent`].
#[derive(Debug, Error)]
pub enum SyncError {
  /// The remote call failed at the transport level or returned an error status.
  #[error("network request failed: {0}")]
  Network(String),

  /// The remote rejected the call pending fresh user authorization.
  #[error("authorization required: {0}")]
  AuthRequired(String),

  /// The remote answered, but not with anything we can use.
  #[error("malformed response: {0}")]
  Malformed(String),

  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("config error: {0}")]
  Config(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("background task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

impl SyncError {
  pub fn is_auth(&self) -> bool {
    matches!(self, SyncError::AuthRequired(_))
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() { SyncError::Malformed(e.to_string()) } else { SyncError::Network(e.to_string()) }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Config(e.to_string())
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
