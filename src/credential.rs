//! Persisted bearer token. This is the only durable client-side state.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use tracing::debug;

use crate::constants::constants;

pub trait CredentialStore: Send + Sync {
  /// Returns the stored token, or `None` when logged out.
  fn load(&self) -> Result<Option<String>>;
  fn save(&self, token: &str) -> Result<()>;
  fn clear(&self) -> Result<()>;
}

/// Token kept in a single file under the platform data directory.
pub struct FileCredentialStore {
  path: PathBuf,
}

impl FileCredentialStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Store located at `<data_dir>/credential`.
  pub fn default_location() -> Result<Self> {
    let proj_dirs =
      ProjectDirs::from("", "", &constants().app_name).context("Could not determine the user data directory")?;
    Ok(Self::new(proj_dirs.data_dir().join(&constants().credential_file)))
  }
}

impl CredentialStore for FileCredentialStore {
  fn load(&self) -> Result<Option<String>> {
    match std::fs::read_to_string(&self.path) {
      Ok(content) => {
        let token = content.trim();
        Ok((!token.is_empty()).then(|| token.to_string()))
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e).with_context(|| format!("Failed to read credential from {}", self.path.display())),
    }
  }

  fn save(&self, token: &str) -> Result<()> {
    if let Some(dir) = self.path.parent() {
      std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(&self.path, token).with_context(|| format!("Failed to write {}", self.path.display()))?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions on {}", self.path.display()))?;
    }
    debug!(path = %self.path.display(), "credential: saved");
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    match std::fs::remove_file(&self.path) {
      Ok(()) => {
        debug!(path = %self.path.display(), "credential: cleared");
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
    }
  }
}

/// Non-persistent store, used by tests and one-shot invocations with `--token`.
#[derive(Default)]
pub struct MemoryCredentialStore {
  token: StdMutex<Option<String>>,
}

impl MemoryCredentialStore {
  pub fn with_token(token: impl Into<String>) -> Self {
    Self { token: StdMutex::new(Some(token.into())) }
  }
}

impl CredentialStore for MemoryCredentialStore {
  fn load(&self) -> Result<Option<String>> {
    Ok(self.token.lock().map_err(|_| anyhow::anyhow!("credential lock poisoned"))?.clone())
  }

  fn save(&self, token: &str) -> Result<()> {
    *self.token.lock().map_err(|_| anyhow::anyhow!("credential lock poisoned"))? = Some(token.to_string());
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    *self.token.lock().map_err(|_| anyhow::anyhow!("credential lock poisoned"))? = None;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCredentialStore::new(dir.path().join("nested").join("credential"));
    assert_eq!(store.load().unwrap(), None);

    store.save("abc.def.ghi").unwrap();
    assert_eq!(store.load().unwrap().as_deref(), Some("abc.def.ghi"));

    store.clear().unwrap();
    assert_eq!(store.load().unwrap(), None);
    // Clearing twice is not an error.
    store.clear().unwrap();
  }

  #[test]
  fn blank_file_means_logged_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credential");
    std::fs::write(&path, "  \n").unwrap();
    assert_eq!(FileCredentialStore::new(path).load().unwrap(), None);
  }

  #[test]
  fn memory_store() {
    let store = MemoryCredentialStore::with_token("t");
    assert_eq!(store.load().unwrap().as_deref(), Some("t"));
    store.clear().unwrap();
    assert_eq!(store.load().unwrap(), None);
  }
}
