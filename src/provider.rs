//! The channel/ban config: which channel handles the user follows and which
//! videos they banned. Owned outside the cache; engines only read it and add bans.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::constants::constants;
use crate::error::{SyncError, SyncResult};

/// Read contract plus the single mutation the engines need.
pub trait ConfigProvider: Send + Sync {
  /// Desired channel handles, in user order.
  fn channel_handles(&self) -> Vec<String>;

  /// Banned video id → description retained for display.
  fn banned_videos(&self) -> BTreeMap<String, String>;

  fn is_banned(&self, video_id: &str) -> bool {
    self.banned_videos().contains_key(video_id)
  }

  /// Record a ban durably. Visible to every later read once this returns `Ok`.
  fn ban_video(&self, video_id: &str, description: &str) -> SyncResult<()>;
}

/// On-disk shape of the user-editable config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
  #[serde(default)]
  pub channel_handles: Vec<String>,
  #[serde(default)]
  pub banned_video_ids: BTreeMap<String, String>,
}

impl ChannelConfig {
  pub fn with_default_handles() -> Self {
    Self { channel_handles: constants().default_channel_handles.clone(), banned_video_ids: BTreeMap::new() }
  }
}

/// JSON-file backed provider. The whole file is rewritten atomically on each ban.
pub struct JsonConfigFile {
  path: PathBuf,
  state: RwLock<ChannelConfig>,
}

impl JsonConfigFile {
  /// Load `path`, seeding it with the default handles on first run.
  pub fn open(path: &Path) -> SyncResult<Self> {
    let config = if path.exists() {
      read_config(path)?
    } else {
      info!(path = %path.display(), "config: channel file not found, creating from defaults");
      let config = ChannelConfig::with_default_handles();
      write_config(path, &config)?;
      config
    };
    info!(handles = config.channel_handles.len(), bans = config.banned_video_ids.len(), "config: loaded");
    Ok(Self { path: path.to_path_buf(), state: RwLock::new(config) })
  }

  /// Re-read the file after the user edited it by hand.
  pub fn reload(&self) -> SyncResult<()> {
    let config = read_config(&self.path)?;
    *self.write() = config;
    Ok(())
  }

  pub fn snapshot(&self) -> ChannelConfig {
    self.read().clone()
  }

  fn read(&self) -> RwLockReadGuard<'_, ChannelConfig> {
    self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, ChannelConfig> {
    self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl ConfigProvider for JsonConfigFile {
  fn channel_handles(&self) -> Vec<String> {
    self.read().channel_handles.clone()
  }

  fn banned_videos(&self) -> BTreeMap<String, String> {
    self.read().banned_video_ids.clone()
  }

  fn is_banned(&self, video_id: &str) -> bool {
    self.read().banned_video_ids.contains_key(video_id)
  }

  fn ban_video(&self, video_id: &str, description: &str) -> SyncResult<()> {
    let mut state = self.write();
    let previous = state.banned_video_ids.insert(video_id.to_string(), description.to_string());
    if let Err(e) = write_config(&self.path, &state) {
      warn!(video_id, err = %e, "config: failed to persist ban, reverting");
      match previous {
        Some(old) => state.banned_video_ids.insert(video_id.to_string(), old),
        None => state.banned_video_ids.remove(video_id),
      };
      return Err(e);
    }
    info!(video_id, "config: video banned");
    Ok(())
  }
}

fn read_config(path: &Path) -> SyncResult<ChannelConfig> {
  let content = std::fs::read_to_string(path)?;
  serde_json::from_str(&content)
    .map_err(|e| SyncError::Config(format!("invalid channel config {}: {}", path.display(), e)))
}

/// Write to a sibling temp file, then rename over the target.
fn write_config(path: &Path, config: &ChannelConfig) -> SyncResult<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  let json = serde_json::to_string_pretty(config)?;
  let tmp_path = path.with_extension("json.part");
  std::fs::write(&tmp_path, json)?;
  std::fs::rename(&tmp_path, path)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn first_open_seeds_default_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("channel_handles.json");
    let config = JsonConfigFile::open(&path).unwrap();
    assert!(path.exists());
    assert_eq!(config.channel_handles(), constants().default_channel_handles);
    assert!(config.banned_videos().is_empty());
  }

  #[test]
  fn reads_existing_file_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel_handles.json");
    std::fs::write(&path, r#"{"channel_handles": ["@zeta", "@alpha"], "banned_video_ids": {"v1": "Old clip"}}"#)
      .unwrap();
    let config = JsonConfigFile::open(&path).unwrap();
    assert_eq!(config.channel_handles(), ["@zeta", "@alpha"]);
    assert!(config.is_banned("v1"));
    assert!(!config.is_banned("v2"));
  }

  #[test]
  fn missing_ban_section_defaults_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel_handles.json");
    std::fs::write(&path, r#"{"channel_handles": ["@alpha"]}"#).unwrap();
    assert!(JsonConfigFile::open(&path).unwrap().banned_videos().is_empty());
  }

  #[test]
  fn ban_is_persisted_and_visible() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel_handles.json");
    let config = JsonConfigFile::open(&path).unwrap();
    config.ban_video("v2", "Clickbait").unwrap();
    assert!(config.is_banned("v2"));

    let reopened = JsonConfigFile::open(&path).unwrap();
    assert_eq!(reopened.banned_videos().get("v2").map(String::as_str), Some("Clickbait"));
    assert_eq!(reopened.snapshot().channel_handles, config.channel_handles());
  }

  #[test]
  fn malformed_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel_handles.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(JsonConfigFile::open(&path), Err(SyncError::Config(_))));
  }

  #[test]
  fn reload_picks_up_hand_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel_handles.json");
    let config = JsonConfigFile::open(&path).unwrap();
    std::fs::write(&path, r#"{"channel_handles": ["@edited"], "banned_video_ids": {}}"#).unwrap();
    config.reload().unwrap();
    assert_eq!(config.channel_handles(), ["@edited"]);
  }
}
