use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::constants;

/// User preferences from `<config_dir>/prefs.toml`. Every field is optional;
/// unset fields fall back to `constants.ron`.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct Config {
  pub api_url: Option<String>,
  /// Push channel base. Derived from `api_url` when unset.
  pub push_url: Option<String>,
  /// Base URL that storage locators are joined onto for playback.
  pub storage_url: Option<String>,
  pub poll_interval_secs: Option<u64>,
  pub request_timeout_secs: Option<u64>,
  pub log_level: Option<String>,
}

impl Config {
  pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", &constants().app_name).map(|dirs| dirs.config_dir().join("prefs.toml"))
  }

  /// Load from the default location, falling back to defaults on any problem.
  pub fn load() -> Self {
    Self::default_path().map(|path| Self::load_from(&path)).unwrap_or_default()
  }

  pub fn load_from(path: &Path) -> Self {
    if let Ok(content) = std::fs::read_to_string(path)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }
    Self::default()
  }

  pub fn save(&self) -> Result<()> {
    let path = Self::default_path().context("Could not determine the user config directory")?;
    self.save_to(&path)
  }

  pub fn save_to(&self, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
      std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let content = toml::to_string(self).context("Failed to serialize preferences")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
  }

  /// Apply `VIDSYNC_API_URL` / `VIDSYNC_PUSH_URL` when set.
  pub fn with_env(mut self) -> Self {
    if let Ok(url) = std::env::var("VIDSYNC_API_URL")
      && !url.trim().is_empty()
    {
      self.api_url = Some(url);
    }
    if let Ok(url) = std::env::var("VIDSYNC_PUSH_URL")
      && !url.trim().is_empty()
    {
      self.push_url = Some(url);
    }
    self
  }

  pub fn api_url(&self) -> &str {
    self.api_url.as_deref().unwrap_or(&constants().default_api_url)
  }

  pub fn push_url(&self) -> String {
    if let Some(url) = &self.push_url {
      return url.trim_end_matches('/').to_string();
    }
    let api = self.api_url().trim_end_matches('/');
    let ws = if let Some(rest) = api.strip_prefix("https://") {
      format!("wss://{}", rest)
    } else if let Some(rest) = api.strip_prefix("http://") {
      format!("ws://{}", rest)
    } else {
      api.to_string()
    };
    format!("{}{}", ws, constants().push_path)
  }

  pub fn storage_url(&self) -> &str {
    self.storage_url.as_deref().unwrap_or(&constants().default_storage_url)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.unwrap_or(constants().poll_interval_secs).max(1))
  }

  pub fn request_timeout_secs(&self) -> u64 {
    self.request_timeout_secs.unwrap_or(constants().request_timeout_secs)
  }

  pub fn log_level(&self) -> &str {
    self.log_level.as_deref().unwrap_or("info")
  }
}
