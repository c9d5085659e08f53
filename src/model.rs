use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;

use crate::constants::constants;

pub type VideoId = String;
pub type UserId = i64;

/// Transcoding job state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl ProcessingStatus {
  /// Ordering used to reject backward transitions. Both terminal states share the top rank.
  pub fn rank(self) -> u8 {
    match self {
      ProcessingStatus::Pending => 0,
      ProcessingStatus::Processing => 1,
      ProcessingStatus::Completed | ProcessingStatus::Failed => 2,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
  }

  pub fn label(self) -> &'static str {
    match self {
      ProcessingStatus::Pending => "pending",
      ProcessingStatus::Processing => "processing",
      ProcessingStatus::Completed => "completed",
      ProcessingStatus::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_lowercase().as_str() {
      "pending" => Some(ProcessingStatus::Pending),
      "processing" => Some(ProcessingStatus::Processing),
      "completed" => Some(ProcessingStatus::Completed),
      "failed" => Some(ProcessingStatus::Failed),
      _ => None,
    }
  }
}

impl fmt::Display for ProcessingStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

/// Video category. The backend treats this as free text, so unknown values are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
  /// The feed filter value that disables category filtering.
  pub const ALL: &'static str = "All";

  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn all() -> Self {
    Self(Self::ALL.to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_all(&self) -> bool {
    self.0.eq_ignore_ascii_case(Self::ALL)
  }

  /// Whether this is one of the categories the backend ships with.
  pub fn is_known(&self) -> bool {
    constants().categories.iter().any(|c| c.eq_ignore_ascii_case(&self.0))
  }
}

impl Default for Category {
  fn default() -> Self {
    Self(constants().default_category.clone())
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

fn nullable_category<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Category, D::Error> {
  Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.trim().is_empty()).map(Category).unwrap_or_default())
}

/// The backend emits naive UTC timestamps; accept RFC 3339 as well.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Some(dt.with_timezone(&Utc));
  }
  NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok().map(|naive| naive.and_utc())
}

fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error> {
  let raw = String::deserialize(deserializer)?;
  parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

fn optional_timestamp<'de, D: Deserializer<'de>>(
  deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
  match Option::<String>::deserialize(deserializer)? {
    Some(raw) => parse_timestamp(&raw)
      .map(Some)
      .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw))),
    None => Ok(None),
  }
}

/// A video record mirrored from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
  pub id: VideoId,
  #[serde(default)]
  pub filename: String,
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default, deserialize_with = "nullable_category")]
  pub category: Category,
  pub owner_id: UserId,
  #[serde(default)]
  pub owner_email: Option<String>,
  #[serde(rename = "file_size", default)]
  pub size_bytes: u64,
  #[serde(deserialize_with = "timestamp")]
  pub created_at: DateTime<Utc>,
  #[serde(rename = "is_shared", default)]
  pub shared: bool,
  #[serde(rename = "is_deleted", default)]
  pub deleted: bool,
  pub status: ProcessingStatus,
  /// Object key of the transcoded output. Only meaningful once `status` is completed.
  #[serde(rename = "s3_key", default)]
  pub storage_key: Option<String>,
}

impl VideoRecord {
  pub fn display_title(&self) -> &str {
    match self.title.as_deref() {
      Some(t) if !t.trim().is_empty() => t,
      _ if !self.filename.is_empty() => &self.filename,
      _ => "Untitled",
    }
  }

  /// Storage key usable for playback, if the record is completed and carries one.
  pub fn locator(&self) -> Option<&str> {
    if self.status != ProcessingStatus::Completed {
      return None;
    }
    self.storage_key.as_deref().filter(|k| !k.is_empty())
  }

  /// Build a playback/download URL from the storage base URL.
  pub fn playback_url(&self, storage_base: &str) -> Option<String> {
    self.locator().map(|key| format!("{}/{}", storage_base.trim_end_matches('/'), key.trim_start_matches('/')))
  }

  /// Nothing left to learn from the backend: failed, or completed with a locator.
  /// A completion heard over the push channel has no locator yet and stays unsettled.
  pub fn is_settled(&self) -> bool {
    match self.status {
      ProcessingStatus::Failed => true,
      ProcessingStatus::Completed => self.locator().is_some(),
      _ => false,
    }
  }
}

/// A status change delivered by the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusEvent {
  pub video_id: VideoId,
  pub status: ProcessingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
  User,
  Admin,
  Banned,
}

impl Role {
  pub fn label(self) -> &'static str {
    match self {
      Role::User => "user",
      Role::Admin => "admin",
      Role::Banned => "banned",
    }
  }
}

fn default_true() -> bool {
  true
}

/// A user account as listed by the admin users endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
  pub id: UserId,
  pub email: String,
  #[serde(default)]
  pub is_admin: bool,
  #[serde(default = "default_true")]
  pub is_active: bool,
  #[serde(default, deserialize_with = "optional_timestamp")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub storage_limit: u64,
}

impl UserRecord {
  pub fn role(&self) -> Role {
    if !self.is_active {
      Role::Banned
    } else if self.is_admin {
      Role::Admin
    } else {
      Role::User
    }
  }

  pub fn apply_role(&mut self, role: Role) {
    match role {
      Role::Admin => {
        self.is_admin = true;
        self.is_active = true;
      }
      Role::Banned => self.is_active = false,
      Role::User => {
        self.is_admin = false;
        self.is_active = true;
      }
    }
  }
}

/// Form fields sent along with an upload.
#[derive(Debug, Clone)]
pub struct UploadMetadata {
  pub title: String,
  pub description: Option<String>,
  pub category: Category,
  pub shared: bool,
  pub resolution: String,
}

impl UploadMetadata {
  pub fn titled(title: impl Into<String>) -> Self {
    Self { title: title.into(), ..Self::default() }
  }
}

impl Default for UploadMetadata {
  fn default() -> Self {
    Self {
      title: String::new(),
      description: None,
      category: Category::default(),
      shared: false,
      resolution: constants().default_resolution.clone(),
    }
  }
}

/// The file part of an upload, read fully into memory.
#[derive(Debug, Clone)]
pub struct UploadFile {
  pub file_name: String,
  pub bytes: Vec<u8>,
}

impl UploadFile {
  pub async fn read(path: &Path) -> Result<Self> {
    let bytes = tokio::fs::read(path).await.with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
      .file_name()
      .and_then(|n| n.to_str())
      .map(str::to_string)
      .with_context(|| format!("{} has no usable file name", path.display()))?;
    Ok(Self { file_name, bytes })
  }
}


#[cfg(test)]
mod tests {
  use super::fixtures::video;
  use super::*;

  #[test]
  fn status_ranks_are_monotonic() {
    assert!(ProcessingStatus::Pending.rank() < ProcessingStatus::Processing.rank());
    assert!(ProcessingStatus::Processing.rank() < ProcessingStatus::Completed.rank());
    assert_eq!(ProcessingStatus::Completed.rank(), ProcessingStatus::Failed.rank());
    assert!(!ProcessingStatus::Processing.is_terminal());
    assert!(ProcessingStatus::Failed.is_terminal());
  }

  #[test]
  fn status_parse_is_case_insensitive() {
    assert_eq!(ProcessingStatus::parse("Completed"), Some(ProcessingStatus::Completed));
    assert_eq!(ProcessingStatus::parse(" processing "), Some(ProcessingStatus::Processing));
    assert_eq!(ProcessingStatus::parse("queued"), None);
  }

  #[test]
  fn decodes_backend_video_payload() {
    let json = r#"{
      "id": "3f2a", "filename": "cat.mov", "title": "Cat", "description": null,
      "category": null, "is_shared": true, "status": "processing", "s3_key": null,
      "created_at": "2024-05-01T10:20:30.123456", "owner_id": 7, "file_size": 2048,
      "is_deleted": false, "owner_email": "cat@example.com"
    }"#;
    let record: VideoRecord = serde_json::from_str(json).unwrap();
    assert_eq!(record.id, "3f2a");
    assert_eq!(record.category, Category::default());
    assert_eq!(record.status, ProcessingStatus::Processing);
    assert!(record.shared);
    assert_eq!(record.size_bytes, 2048);
    assert_eq!(record.created_at.to_rfc3339(), "2024-05-01T10:20:30.123456+00:00");
  }

  #[test]
  fn keeps_unknown_categories() {
    let json = r#"{"id":"a","status":"pending","created_at":"2024-05-01T10:20:30Z","owner_id":1,"category":"Cooking"}"#;
    let record: VideoRecord = serde_json::from_str(json).unwrap();
    assert_eq!(record.category.as_str(), "Cooking");
    assert!(!record.category.is_known());
  }

  #[test]
  fn locator_requires_completed_status() {
    let mut record = video("a", ProcessingStatus::Completed);
    assert_eq!(
      record.playback_url("http://localhost:9000/processed-videos/"),
      Some("http://localhost:9000/processed-videos/processed/user_1/a.mp4".to_string())
    );
    record.status = ProcessingStatus::Processing;
    assert_eq!(record.locator(), None);
    assert_eq!(record.playback_url("http://localhost:9000"), None);
  }

  #[test]
  fn completed_without_locator_is_unsettled() {
    let mut record = video("a", ProcessingStatus::Completed);
    assert!(record.is_settled());
    record.storage_key = None;
    assert!(!record.is_settled());
    assert!(video("b", ProcessingStatus::Failed).is_settled());
    assert!(!video("c", ProcessingStatus::Pending).is_settled());
  }

  #[test]
  fn display_title_falls_back_to_filename() {
    let mut record = video("a", ProcessingStatus::Pending);
    record.title = Some("  ".into());
    assert_eq!(record.display_title(), "a.mp4");
    record.filename.clear();
    assert_eq!(record.display_title(), "Untitled");
  }

  #[test]
  fn user_roles() {
    let mut user = super::fixtures::user(3, false);
    assert_eq!(user.role(), Role::User);
    user.apply_role(Role::Admin);
    assert_eq!(user.role(), Role::Admin);
    user.apply_role(Role::Banned);
    assert_eq!(user.role(), Role::Banned);
  }
}
