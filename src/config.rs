use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::constants;

/// User preferences from `prefs.toml` in the platform config directory.
/// Every field is optional; missing ones fall back to constants or platform paths.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct Prefs {
  /// YouTube Data API key. `YOUTUBE_API_KEY` takes precedence when set.
  pub api_key: Option<String>,
  /// OAuth bearer token obtained by the outer application.
  pub access_token: Option<String>,
  pub history_limit: Option<usize>,
  pub database_path: Option<PathBuf>,
  pub channels_file: Option<PathBuf>,
}

pub fn project_dirs() -> Option<ProjectDirs> {
  ProjectDirs::from("", "", &constants().app_name)
}

impl Prefs {
  pub fn load() -> Self {
    if let Some(proj_dirs) = project_dirs() {
      let prefs_file = proj_dirs.config_dir().join(&constants().prefs_file);
      if let Ok(prefs) = Self::load_from(&prefs_file) {
        return prefs;
      }
    }
    Self::default()
  }

  pub fn load_from(path: &Path) -> Result<Self> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Invalid prefs file {}", path.display()))
  }

  pub fn save(&self) -> Result<()> {
    let proj_dirs = project_dirs().context("No home directory for prefs")?;
    let config_dir = proj_dirs.config_dir();
    std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
    let content = toml::to_string(self).context("Failed to serialize prefs")?;
    std::fs::write(config_dir.join(&constants().prefs_file), content).context("Failed to write prefs")
  }

  pub fn api_key(&self) -> Option<String> {
    std::env::var("YOUTUBE_API_KEY").ok().filter(|k| !k.is_empty()).or_else(|| self.api_key.clone())
  }

  pub fn history_limit(&self) -> usize {
    self.history_limit.filter(|n| *n > 0).unwrap_or(constants().history_limit)
  }

  pub fn database_path(&self) -> Option<PathBuf> {
    self.database_path.clone().or_else(|| project_dirs().map(|d| d.data_dir().join(&constants().database_file)))
  }

  pub fn channels_path(&self) -> Option<PathBuf> {
    self.channels_file.clone().or_else(|| project_dirs().map(|d| d.config_dir().join(&constants().channels_file)))
  }

  pub fn log_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.data_local_dir().join("logs"))
  }
}
