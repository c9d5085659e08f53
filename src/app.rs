use anyhow::{Context, Result, bail, ensure};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};

use crate::backend::{Backend, FeedQuery, HttpBackend};
use crate::config::Config;
use crate::credential::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
use crate::error::Error;
use crate::gateway::{MutationGateway, RoleOutcome};
use crate::model::{Category, Role, UploadFile, UploadMetadata, UserId, UserRecord, VideoRecord};
use crate::selector::ViewMode;
use crate::session::{Session, SessionResolver};
use crate::sync::{self, Notice, SyncHandle, SyncStatus};

// --- Rendering ---

fn render_record(out: &mut String, record: &VideoRecord, storage_url: &str) {
  let _ = write!(
    out,
    "{:<38} {:<10} {} [{}]",
    record.id,
    record.status.label(),
    record.display_title(),
    record.category.as_str()
  );
  if record.shared {
    out.push_str(" (shared)");
  }
  if record.deleted {
    out.push_str(" (user deleted)");
  }
  if let Some(url) = record.playback_url(storage_url) {
    let _ = write!(out, "\n{:<38} {}", "", url);
  }
  out.push('\n');
}

pub fn render_records(records: &[VideoRecord], status: &SyncStatus, storage_url: &str) -> String {
  let mut out = String::new();
  let source = status.source.map_or("videos", |s| s.label());
  let live = if status.push_connected { ", live" } else { "" };
  let _ = writeln!(out, "{} ({}, {} total{})", source, status.tier, records.len(), live);
  if records.is_empty() {
    out.push_str("  nothing here yet\n");
  }
  for record in records {
    render_record(&mut out, record, storage_url);
  }
  out
}

pub fn render_users(users: &[UserRecord]) -> String {
  let mut out = String::new();
  for user in users {
    let quota = if user.is_admin { "unlimited".to_string() } else { format!("{} MB", user.storage_limit / (1024 * 1024)) };
    let _ = writeln!(out, "{:>5}  {:<32} {:<7} {}", user.id, user.email, user.role().label(), quota);
  }
  if users.is_empty() {
    out.push_str("no users\n");
  }
  out
}

// --- App ---

pub struct App {
  config: Config,
  backend: Arc<dyn Backend>,
  credentials: Arc<dyn CredentialStore>,
  /// Clear the stored credential once the backend rejects it. Off for `--token`.
  forget_rejected: bool,
}

impl App {
  /// `token` overrides the stored credential for this invocation only.
  pub fn new(config: Config, token: Option<String>) -> Result<Self> {
    let backend = HttpBackend::new(&config).context("Failed to build the HTTP client")?;
    let Some(token) = token else {
      let credentials = Arc::new(FileCredentialStore::default_location()?);
      return Ok(Self::with_parts(config, Arc::new(backend), credentials));
    };
    debug!("app: using token from the command line");
    let credentials = Arc::new(MemoryCredentialStore::with_token(token));
    Ok(Self { forget_rejected: false, ..Self::with_parts(config, Arc::new(backend), credentials) })
  }

  pub fn with_parts(config: Config, backend: Arc<dyn Backend>, credentials: Arc<dyn CredentialStore>) -> Self {
    Self { config, backend, credentials, forget_rejected: true }
  }

  #[cfg(test)]
  fn keep_rejected_credential(mut self) -> Self {
    self.forget_rejected = false;
    self
  }

  fn resolver(&self) -> SessionResolver {
    SessionResolver::new(Arc::clone(&self.backend), Arc::clone(&self.credentials))
  }

  async fn session(&self) -> Session {
    self.resolver().resolve().await
  }

  async fn signed_in(&self) -> Result<Session> {
    let session = self.session().await;
    ensure!(session.is_authenticated(), "Not logged in. Run `vidsync login <email>` first.");
    Ok(session)
  }

  fn spawn_sync(&self, session: Session, mode: ViewMode, feed: FeedQuery) -> SyncHandle {
    sync::spawn(Arc::clone(&self.backend), session, mode, feed, self.config.poll_interval())
  }

  // --- Account ---

  pub async fn login(&self, email: &str, password: Option<String>) -> Result<()> {
    let password = read_password(password).await?;
    let token = self.backend.authenticate(email, &password).await.context("Login failed")?;
    self.resolver().login(&token).context("Failed to store the credential")?;
    let session = self.session().await;
    info!(tier = %session.tier(), "app: logged in");
    println!("Logged in as {} ({})", email, session.tier());
    Ok(())
  }

  pub async fn register(&self, email: &str, password: Option<String>) -> Result<()> {
    let password = read_password(password).await?;
    self.backend.register(email, &password).await.context("Registration failed")?;
    println!("Registered {}. Run `vidsync login {}` to sign in.", email, email);
    Ok(())
  }

  pub fn logout(&self) -> Result<()> {
    let mut session = Session::anonymous();
    self.resolver().logout(&mut session).context("Failed to remove the stored credential")?;
    println!("Logged out");
    Ok(())
  }

  pub async fn whoami(&self) -> Result<()> {
    let session = self.session().await;
    match session.subject() {
      Some(subject) => println!("{} ({})", subject, session.tier()),
      None => println!("{}", session.tier()),
    }
    Ok(())
  }

  // --- Videos ---

  pub async fn library(&self, watch: bool) -> Result<()> {
    let session = self.signed_in().await?;
    let handle = self.spawn_sync(session, ViewMode::PrivateLibrary, FeedQuery::default());
    self.follow(handle, watch).await
  }

  pub async fn feed(&self, text: Option<String>, category: Category, skip: usize, watch: bool) -> Result<()> {
    if !category.is_known() {
      debug!(category = category.as_str(), "app: filtering by a custom category");
    }
    let query = FeedQuery { text, category, skip, ..FeedQuery::default() };
    let session = self.session().await;
    let handle = self.spawn_sync(session, ViewMode::PublicFeed, query);
    self.follow(handle, watch).await
  }

  pub async fn status(&self, id: &str) -> Result<()> {
    let record = self.backend.fetch_job_status(id).await.with_context(|| format!("Failed to look up {}", id))?;
    let mut out = String::new();
    render_record(&mut out, &record, self.config.storage_url());
    print!("{}", out);
    Ok(())
  }

  pub async fn upload(&self, path: &Path, metadata: UploadMetadata, watch: bool) -> Result<()> {
    let file = UploadFile::read(path).await?;
    let session = self.signed_in().await?;

    if !watch {
      let gateway = MutationGateway::new(Arc::clone(&self.backend), session);
      let record = gateway.upload(&metadata, Some(&file)).await.context("Upload failed")?;
      println!("Uploaded {} as {} ({})", file.file_name, record.id, record.status);
      return Ok(());
    }

    let handle = self.spawn_sync(session.clone(), ViewMode::PrivateLibrary, FeedQuery::default());
    let gateway = MutationGateway::new(Arc::clone(&self.backend), session).with_sync(handle.sender());
    let record = gateway.upload(&metadata, Some(&file)).await.context("Upload failed")?;
    println!("Uploaded {} as {} ({})", file.file_name, record.id, record.status);
    self.follow(handle, true).await
  }

  pub async fn delete(&self, id: &str) -> Result<()> {
    let gateway = MutationGateway::new(Arc::clone(&self.backend), self.signed_in().await?);
    match gateway.delete(id).await {
      Ok(()) => {
        println!("Deleted {}", id);
        Ok(())
      }
      Err(Error::Permission(_)) => bail!("You may only delete your own videos"),
      Err(e) => Err(e).with_context(|| format!("Failed to delete {}", id)),
    }
  }

  /// Print snapshots as the synchronizer publishes them. Without `watch`, stops after the
  /// first applied cycle; with it, once nothing is left processing or on Ctrl-C.
  async fn follow(&self, mut handle: SyncHandle, watch: bool) -> Result<()> {
    let mut reader = handle.reader();
    let mut status = handle.status_changes();
    let mut printed = None;

    loop {
      tokio::select! {
        biased;
        notice = handle.next_notice() => match notice {
          Some(Notice::LoginRequired) => {
            handle.shutdown().await;
            bail!("Not logged in. Run `vidsync login <email>` first.");
          }
          Some(Notice::SessionExpired) => {
            handle.shutdown().await;
            if self.forget_rejected {
              match self.credentials.clear() {
                Ok(()) => info!("app: cleared the rejected credential"),
                Err(e) => warn!(err = %e, "app: failed to clear the rejected credential"),
              }
            }
            bail!("The session expired. Run `vidsync login <email>` to sign in again.");
          }
          Some(Notice::FetchFailed(e)) if !watch => {
            handle.shutdown().await;
            return Err(e).context("Failed to fetch videos");
          }
          Some(Notice::FetchFailed(e)) => eprintln!("warning: {} (retrying)", e),
          None => break,
        },
        changed = reader.changed() => if changed.is_none() {
          break;
        },
        changed = status.changed() => if changed.is_err() {
          break;
        },
        _ = tokio::signal::ctrl_c(), if watch => {
          info!("app: interrupted");
          break;
        }
      }

      let current = handle.status();
      // A cycle ended without a listing; the notice explaining why is still queued.
      if current.applied_sequence == 0 || current.source.is_none() {
        continue;
      }
      let snapshot = handle.snapshot();
      if printed.as_ref() != Some(&snapshot) {
        print!("{}", render_records(&snapshot, &current, self.config.storage_url()));
        printed = Some(snapshot);
      }
      if !watch || !current.pulling {
        break;
      }
    }

    handle.shutdown().await;
    Ok(())
  }

  // --- Users ---

  async fn admin_gateway(&self) -> Result<MutationGateway> {
    let mut gateway = MutationGateway::new(Arc::clone(&self.backend), self.signed_in().await?);
    if let Err(e) = gateway.load_users().await {
      return match e {
        Error::Authorization(_) => bail!("Admin access required"),
        e => Err(e).context("Failed to load users"),
      };
    }
    Ok(gateway)
  }

  pub async fn users(&self) -> Result<()> {
    let gateway = self.admin_gateway().await?;
    print!("{}", render_users(gateway.users().users()));
    Ok(())
  }

  pub async fn promote(&self, id: UserId) -> Result<()> {
    let mut gateway = self.admin_gateway().await?;
    let outcome = gateway.promote(id).await.with_context(|| format!("Failed to promote user {}", id))?;
    report_role(id, Role::Admin, outcome);
    Ok(())
  }

  pub async fn ban(&self, id: UserId) -> Result<()> {
    let mut gateway = self.admin_gateway().await?;
    let outcome = gateway.ban(id).await.with_context(|| format!("Failed to ban user {}", id))?;
    report_role(id, Role::Banned, outcome);
    Ok(())
  }

  pub async fn remove_user(&self, id: UserId) -> Result<()> {
    let mut gateway = self.admin_gateway().await?;
    gateway.remove_user(id).await.with_context(|| format!("Failed to remove user {}", id))?;
    println!("Removed user {}", id);
    Ok(())
  }
}

fn report_role(id: UserId, role: Role, outcome: RoleOutcome) {
  match outcome {
    RoleOutcome::Applied => println!("User {} is now {}", id, role.label()),
    RoleOutcome::Unchanged => println!("User {} is already {}", id, role.label()),
  }
}

async fn read_password(password: Option<String>) -> Result<String> {
  if let Some(password) = password {
    return Ok(password);
  }
  eprint!("Password: ");
  let mut line = String::new();
  tokio::io::BufReader::new(tokio::io::stdin()).read_line(&mut line).await.context("Failed to read password")?;
  let password = line.trim_end_matches(['\r', '\n']).to_string();
  if password.is_empty() {
    warn!("app: empty password");
    bail!("A password is required");
  }
  Ok(password)
}
