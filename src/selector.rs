//! Chooses which backend collection backs the current view.
//!
//! The private library is resolved by probing the admin-only listing and falling
//! back to the caller's own videos when the probe is refused. A refusal is told
//! apart from an admin with no videos by status, never by an empty payload.

use clap::ValueEnum;
use std::fmt;
use tracing::{debug, info};

use crate::backend::{Backend, FeedQuery};
use crate::error::{Error, Result};
use crate::model::VideoRecord;
use crate::session::{Session, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ViewMode {
  /// The signed-in user's library (every video, for admins).
  PrivateLibrary,
  /// Shared videos, available without signing in.
  PublicFeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSource {
  AdminLibrary,
  OwnLibrary,
  PublicFeed,
}

impl DataSource {
  pub fn label(self) -> &'static str {
    match self {
      DataSource::AdminLibrary => "all videos",
      DataSource::OwnLibrary => "my videos",
      DataSource::PublicFeed => "public feed",
    }
  }
}

impl fmt::Display for DataSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

/// Outcome of one selection: the source that answered and what it returned.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
  pub source: DataSource,
  /// Tier proven by this selection. `None` when the view does not probe privilege.
  pub tier: Option<Tier>,
  pub records: Vec<VideoRecord>,
}

impl Selection {
  fn new(source: DataSource, tier: Option<Tier>, viewer: Tier, records: Vec<VideoRecord>) -> Self {
    let records = visible_to(viewer, records);
    Self { source, tier, records }
  }

  /// Record the proven tier on the session, if this selection proved one.
  pub fn confirm(&self, session: &mut Session) {
    if let Some(tier) = self.tier {
      session.confirm_tier(tier);
    }
  }
}

/// Soft-deleted records are only ever shown to admins.
pub fn visible_to(viewer: Tier, records: Vec<VideoRecord>) -> Vec<VideoRecord> {
  if viewer == Tier::Admin {
    return records;
  }
  records.into_iter().filter(|r| !r.deleted).collect()
}

/// Resolve `mode` to a data source and fetch it.
///
/// Anonymous sessions asking for the private library get `Error::Unauthenticated`
/// without any request being made. The session is not modified; callers apply
/// the proven tier with [`Selection::confirm`] once they accept the result.
pub async fn select_source(
  backend: &dyn Backend,
  session: &Session,
  mode: ViewMode,
  feed: &FeedQuery,
) -> Result<Selection> {
  match mode {
    ViewMode::PublicFeed => {
      let records = backend.fetch_public_feed(feed).await?;
      debug!(count = records.len(), "select: public feed");
      Ok(Selection::new(DataSource::PublicFeed, None, session.tier(), records))
    }
    ViewMode::PrivateLibrary => {
      let Some(token) = session.token() else {
        debug!("select: anonymous session, login required");
        return Err(Error::Unauthenticated);
      };

      match backend.fetch_private_library(token).await {
        Ok(records) => {
          debug!(count = records.len(), "select: admin probe accepted");
          Ok(Selection::new(DataSource::AdminLibrary, Some(Tier::Admin), Tier::Admin, records))
        }
        Err(e) if e.is_rejection() => {
          if session.is_admin() {
            info!(err = %e, "select: admin probe refused for a previously admin session");
          } else {
            debug!(err = %e, "select: admin probe refused, falling back");
          }
          let records = backend.fetch_own_library(token).await?;
          Ok(Selection::new(DataSource::OwnLibrary, Some(Tier::User), Tier::User, records))
        }
        Err(e) => Err(e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::ProcessingStatus;
  use crate::model::fixtures::video;
  use crate::testing::FakeBackend;

  #[tokio::test]
  async fn anonymous_private_library_never_probes() {
    let backend = FakeBackend::default();
    let err = select_source(&backend, &Session::anonymous(), ViewMode::PrivateLibrary, &FeedQuery::default())
      .await
      .unwrap_err();
    assert_eq!(err, Error::Unauthenticated);
    assert!(backend.calls().is_empty());
  }

  #[tokio::test]
  async fn admin_with_no_videos_does_not_fall_back() {
    let backend = FakeBackend::default();
    backend.push_admin(Ok(vec![]));
    let mut session = Session::authenticated("tok");

    let selection =
      select_source(&backend, &session, ViewMode::PrivateLibrary, &FeedQuery::default()).await.unwrap();
    selection.confirm(&mut session);

    assert_eq!(selection.source, DataSource::AdminLibrary);
    assert!(selection.records.is_empty());
    assert_eq!(session.tier(), Tier::Admin);
    assert_eq!(backend.count("fetch_own_library"), 0);
  }

  #[tokio::test]
  async fn forbidden_probe_falls_back_to_own_library() {
    let backend = FakeBackend::default();
    backend.push_admin(Err(Error::Authorization("Admin access required".into())));
    backend.push_own(Ok(vec![video("a", ProcessingStatus::Pending)]));
    let mut session = Session::authenticated("tok");

    let selection =
      select_source(&backend, &session, ViewMode::PrivateLibrary, &FeedQuery::default()).await.unwrap();
    selection.confirm(&mut session);

    assert_eq!(selection.source, DataSource::OwnLibrary);
    assert_eq!(selection.records.len(), 1);
    assert_eq!(session.tier(), Tier::User);
  }

  #[tokio::test]
  async fn revoked_admin_is_demoted() {
    let backend = FakeBackend::default();
    backend.push_admin(Err(Error::Authorization("Admin access required".into())));
    backend.push_own(Ok(vec![]));
    let mut session = Session::authenticated("tok");
    session.confirm_tier(Tier::Admin);

    let selection =
      select_source(&backend, &session, ViewMode::PrivateLibrary, &FeedQuery::default()).await.unwrap();
    selection.confirm(&mut session);
    assert_eq!(session.tier(), Tier::User);
  }

  #[tokio::test]
  async fn transport_failure_on_probe_does_not_fall_back() {
    let backend = FakeBackend::default();
    backend.push_admin(Err(Error::Transport("connection reset".into())));
    let session = Session::authenticated("tok");

    let err = select_source(&backend, &session, ViewMode::PrivateLibrary, &FeedQuery::default()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(backend.count("fetch_own_library"), 0);
  }

  #[tokio::test]
  async fn public_feed_ignores_tier() {
    let backend = FakeBackend::default();
    backend.push_feed(Ok(vec![video("f", ProcessingStatus::Completed)]));

    let selection =
      select_source(&backend, &Session::anonymous(), ViewMode::PublicFeed, &FeedQuery::default()).await.unwrap();
    assert_eq!(selection.source, DataSource::PublicFeed);
    assert_eq!(selection.tier, None);
    assert_eq!(backend.calls(), vec!["fetch_public_feed".to_string()]);
  }

  #[tokio::test]
  async fn soft_deleted_records_hidden_from_users() {
    let mut trashed = video("t", ProcessingStatus::Completed);
    trashed.deleted = true;
    let records = vec![video("a", ProcessingStatus::Pending), trashed];

    assert_eq!(visible_to(Tier::User, records.clone()).len(), 1);
    assert_eq!(visible_to(Tier::Anonymous, records.clone()).len(), 1);
    assert_eq!(visible_to(Tier::Admin, records).len(), 2);
  }
}
