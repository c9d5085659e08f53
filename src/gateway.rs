//! State-changing intents: uploads, deletions and admin user management.
//!
//! Every mutation is confirm-then-mutate: local state changes only after the
//! backend has accepted the request, so a failure always leaves the registries
//! exactly as they were.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{Error, MutationError, Result, UploadError};
use crate::model::{Role, UploadFile, UploadMetadata, UserId, UserRecord, VideoRecord};
use crate::session::Session;
use crate::sync::SyncSender;

/// Result of a role change that may already have been in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
  Applied,
  /// The user already held the role; nothing was sent.
  Unchanged,
}

/// Local mirror of the admin user listing.
#[derive(Debug, Default)]
pub struct UserRegistry {
  users: Vec<UserRecord>,
}

impl UserRegistry {
  pub fn users(&self) -> &[UserRecord] {
    &self.users
  }

  pub fn get(&self, id: UserId) -> Option<&UserRecord> {
    self.users.iter().find(|u| u.id == id)
  }

  pub fn replace(&mut self, users: Vec<UserRecord>) {
    self.users = users;
  }

  fn apply_role(&mut self, id: UserId, role: Role) {
    if let Some(user) = self.users.iter_mut().find(|u| u.id == id) {
      user.apply_role(role);
    }
  }

  fn remove(&mut self, id: UserId) -> bool {
    let before = self.users.len();
    self.users.retain(|u| u.id != id);
    self.users.len() != before
  }
}

pub struct MutationGateway {
  backend: Arc<dyn Backend>,
  session: Session,
  sync: Option<SyncSender>,
  users: UserRegistry,
}

impl MutationGateway {
  pub fn new(backend: Arc<dyn Backend>, session: Session) -> Self {
    Self { backend, session, sync: None, users: UserRegistry::default() }
  }

  /// Route confirmed video changes into a running synchronizer's registry.
  pub fn with_sync(mut self, sync: SyncSender) -> Self {
    self.sync = Some(sync);
    self
  }

  pub fn users(&self) -> &UserRegistry {
    &self.users
  }

  fn token(&self) -> Result<&str> {
    self.session.token().ok_or(Error::Unauthenticated)
  }

  /// Upload `file` with `metadata`. Title and file are checked before any request.
  pub async fn upload(
    &self,
    metadata: &UploadMetadata,
    file: Option<&UploadFile>,
  ) -> std::result::Result<VideoRecord, UploadError> {
    if metadata.title.trim().is_empty() {
      return Err(Error::Validation("a title is required".to_string()));
    }
    let Some(file) = file.filter(|f| !f.bytes.is_empty()) else {
      return Err(Error::Validation("a non-empty video file is required".to_string()));
    };
    let token = self.token()?;

    info!(file = %file.file_name, size = file.bytes.len(), title = %metadata.title, "gateway: uploading");
    let record = match self.backend.create_video(token, metadata, file).await {
      Ok(record) => record,
      Err(e) => {
        warn!(err = %e, "gateway: upload rejected");
        return Err(e);
      }
    };
    info!(video_id = %record.id, status = %record.status, "gateway: upload accepted");

    if let Some(sync) = &self.sync {
      sync.insert(record.clone()).await;
    }
    Ok(record)
  }

  /// Delete a video. The registry only loses it once the backend has confirmed.
  pub async fn delete(&self, id: &str) -> std::result::Result<(), MutationError> {
    let token = self.token()?;
    if let Err(e) = self.backend.delete_video(token, id).await {
      warn!(video_id = %id, err = %e, "gateway: delete rejected");
      return Err(e);
    }
    info!(video_id = %id, "gateway: deleted");
    if let Some(sync) = &self.sync {
      sync.remove(id.to_string()).await;
    }
    Ok(())
  }

  pub async fn load_users(&mut self) -> Result<&[UserRecord]> {
    let token = self.token()?;
    let users = self.backend.fetch_admin_user_list(token).await?;
    debug!(count = users.len(), "gateway: user list loaded");
    self.users.replace(users);
    Ok(self.users.users())
  }

  pub async fn promote(&mut self, id: UserId) -> std::result::Result<RoleOutcome, MutationError> {
    self.set_role(id, Role::Admin).await
  }

  pub async fn ban(&mut self, id: UserId) -> std::result::Result<RoleOutcome, MutationError> {
    self.set_role(id, Role::Banned).await
  }

  async fn set_role(&mut self, id: UserId, role: Role) -> std::result::Result<RoleOutcome, MutationError> {
    if self.users.get(id).is_some_and(|u| u.role() == role) {
      info!(user_id = id, role = role.label(), "gateway: user already has role");
      return Ok(RoleOutcome::Unchanged);
    }
    let token = self.token()?;
    self.backend.set_user_role(token, id, role).await?;
    self.users.apply_role(id, role);
    info!(user_id = id, role = role.label(), "gateway: role updated");
    Ok(RoleOutcome::Applied)
  }

  /// Permanently remove a user account.
  pub async fn remove_user(&mut self, id: UserId) -> std::result::Result<(), MutationError> {
    let token = self.token()?;
    self.backend.delete_user(token, id).await?;
    if !self.users.remove(id) {
      debug!(user_id = id, "gateway: removed user was not in the local list");
    }
    info!(user_id = id, "gateway: user removed");
    Ok(())
  }
}
