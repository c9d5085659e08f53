//! Error taxonomy shared by the synchronization core.
//!
//! The CLI layer wraps these in `anyhow` with context; everything below `app`
//! returns [`Error`] so callers can branch on the class of failure.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// The session is authenticated but not privileged enough for the resource.
  #[error("not authorized: {0}")]
  Authorization(String),

  /// No credential, or the backend no longer accepts the stored one.
  #[error("login required")]
  Unauthenticated,

  /// A client-side precondition failed. Never reaches the network.
  #[error("invalid request: {0}")]
  Validation(String),

  #[error("storage quota exceeded: {0}")]
  Quota(String),

  #[error("not found: {0}")]
  NotFound(String),

  /// The caller may not mutate the target (e.g. deleting another user's video).
  #[error("permission denied: {0}")]
  Permission(String),

  #[error("server error: {0}")]
  Server(String),

  #[error("network error: {0}")]
  Transport(String),
}

/// Failure of [`crate::gateway::MutationGateway::upload`].
pub type UploadError = Error;

/// Failure of the non-upload mutations (delete, promote, ban).
pub type MutationError = Error;

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  /// Whether the backend refused the request for this credential, as opposed to
  /// failing to answer. Used to drive the admin probe fallback.
  pub fn is_rejection(&self) -> bool {
    matches!(self, Error::Authorization(_) | Error::Unauthenticated | Error::NotFound(_) | Error::Permission(_))
  }
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      Error::Server(format!("malformed response: {}", err))
    } else {
      Error::Transport(err.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejections_are_classified() {
    assert!(Error::Authorization("admin only".into()).is_rejection());
    assert!(Error::Unauthenticated.is_rejection());
    assert!(Error::NotFound("video".into()).is_rejection());
    assert!(!Error::Transport("connection refused".into()).is_rejection());
    assert!(!Error::Server("boom".into()).is_rejection());
  }

  #[test]
  fn display_includes_detail() {
    assert_eq!(Error::Quota("Quota exceeded!".into()).to_string(), "storage quota exceeded: Quota exceeded!");
    assert_eq!(Error::Unauthenticated.to_string(), "login required");
  }
}
