//! Scripted in-memory [`Backend`] for unit tests.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::StreamExt;
use futures::channel::mpsc as fmpsc;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use crate::backend::{Backend, FeedQuery, StatusStream};
use crate::error::{Error, Result};
use crate::model::{Role, StatusEvent, UploadFile, UploadMetadata, UserId, UserRecord, VideoRecord};

/// Unsigned JWT-shaped token whose claims name user `id`.
pub fn token_for_subject(id: UserId) -> String {
  let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
  let claims = serde_json::json!({ "sub": format!("user{}@example.com", id), "id": id });
  format!("{}.{}.signature", header, URL_SAFE_NO_PAD.encode(claims.to_string()))
}

type Scripted<T> = (Result<T>, Duration);

/// Responses are consumed in order; once the queue runs dry the last one keeps
/// repeating, so pull loops can run indefinitely against a steady backend.
struct Script<T> {
  queue: VecDeque<Scripted<T>>,
  last: Option<Scripted<T>>,
}

impl<T> Default for Script<T> {
  fn default() -> Self {
    Self { queue: VecDeque::new(), last: None }
  }
}

impl<T: Clone> Script<T> {
  fn next(&mut self, what: &str) -> Scripted<T> {
    if let Some(next) = self.queue.pop_front() {
      self.last = Some(next.clone());
      return next;
    }
    match &self.last {
      Some(last) => last.clone(),
      None => (Err(Error::Server(format!("unscripted call: {}", what))), Duration::ZERO),
    }
  }
}

#[derive(Default)]
struct FakeState {
  calls: Vec<String>,
  admin: Script<Vec<VideoRecord>>,
  own: Script<Vec<VideoRecord>>,
  feed: Script<Vec<VideoRecord>>,
  users: Script<Vec<UserRecord>>,
  create: Script<VideoRecord>,
  delete: Script<()>,
  set_role: Script<()>,
  delete_user: Script<()>,
  push: Option<fmpsc::UnboundedReceiver<StatusEvent>>,
}

#[derive(Default)]
pub struct FakeBackend {
  state: StdMutex<FakeState>,
}

impl FakeBackend {
  fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
    let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut state)
  }

  pub fn calls(&self) -> Vec<String> {
    self.with_state(|s| s.calls.clone())
  }

  pub fn count(&self, call: &str) -> usize {
    self.with_state(|s| s.calls.iter().filter(|c| *c == call).count())
  }

  pub fn push_admin(&self, result: Result<Vec<VideoRecord>>) {
    self.push_admin_delayed(result, Duration::ZERO);
  }

  pub fn push_admin_delayed(&self, result: Result<Vec<VideoRecord>>, delay: Duration) {
    self.with_state(|s| s.admin.queue.push_back((result, delay)));
  }

  pub fn push_own(&self, result: Result<Vec<VideoRecord>>) {
    self.push_own_delayed(result, Duration::ZERO);
  }

  pub fn push_own_delayed(&self, result: Result<Vec<VideoRecord>>, delay: Duration) {
    self.with_state(|s| s.own.queue.push_back((result, delay)));
  }

  pub fn push_feed(&self, result: Result<Vec<VideoRecord>>) {
    self.with_state(|s| s.feed.queue.push_back((result, Duration::ZERO)));
  }

  pub fn push_users(&self, result: Result<Vec<UserRecord>>) {
    self.with_state(|s| s.users.queue.push_back((result, Duration::ZERO)));
  }

  pub fn push_create(&self, result: Result<VideoRecord>) {
    self.with_state(|s| s.create.queue.push_back((result, Duration::ZERO)));
  }

  pub fn push_delete(&self, result: Result<()>) {
    self.with_state(|s| s.delete.queue.push_back((result, Duration::ZERO)));
  }

  pub fn push_set_role(&self, result: Result<()>) {
    self.with_state(|s| s.set_role.queue.push_back((result, Duration::ZERO)));
  }

  pub fn push_delete_user(&self, result: Result<()>) {
    self.with_state(|s| s.delete_user.queue.push_back((result, Duration::ZERO)));
  }

  /// Arm the push channel; events sent on the returned sender reach the subscriber.
  pub fn push_channel(&self) -> fmpsc::UnboundedSender<StatusEvent> {
    let (tx, rx) = fmpsc::unbounded();
    self.with_state(|s| s.push = Some(rx));
    tx
  }

  fn record(&self, call: &str) {
    self.with_state(|s| s.calls.push(call.to_string()));
  }

  async fn play<T>((result, delay): Scripted<T>) -> Result<T> {
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    result
  }
}

#[async_trait]
impl Backend for FakeBackend {
  async fn authenticate(&self, _email: &str, _password: &str) -> Result<String> {
    self.record("authenticate");
    Ok("token".to_string())
  }

  async fn register(&self, _email: &str, _password: &str) -> Result<()> {
    self.record("register");
    Ok(())
  }

  async fn fetch_private_library(&self, _token: &str) -> Result<Vec<VideoRecord>> {
    self.record("fetch_private_library");
    let scripted = self.with_state(|s| s.admin.next("fetch_private_library"));
    Self::play(scripted).await
  }

  async fn fetch_own_library(&self, _token: &str) -> Result<Vec<VideoRecord>> {
    self.record("fetch_own_library");
    let scripted = self.with_state(|s| s.own.next("fetch_own_library"));
    Self::play(scripted).await
  }

  async fn fetch_public_feed(&self, _query: &FeedQuery) -> Result<Vec<VideoRecord>> {
    self.record("fetch_public_feed");
    let scripted = self.with_state(|s| s.feed.next("fetch_public_feed"));
    Self::play(scripted).await
  }

  async fn fetch_job_status(&self, id: &str) -> Result<VideoRecord> {
    self.record("fetch_job_status");
    Err(Error::NotFound(id.to_string()))
  }

  async fn fetch_admin_user_list(&self, _token: &str) -> Result<Vec<UserRecord>> {
    self.record("fetch_admin_user_list");
    let scripted = self.with_state(|s| s.users.next("fetch_admin_user_list"));
    Self::play(scripted).await
  }

  async fn create_video(&self, _token: &str, _metadata: &UploadMetadata, _file: &UploadFile) -> Result<VideoRecord> {
    self.record("create_video");
    let scripted = self.with_state(|s| s.create.next("create_video"));
    Self::play(scripted).await
  }

  async fn delete_video(&self, _token: &str, _id: &str) -> Result<()> {
    self.record("delete_video");
    let scripted = self.with_state(|s| s.delete.next("delete_video"));
    Self::play(scripted).await
  }

  async fn set_user_role(&self, _token: &str, _id: UserId, _role: Role) -> Result<()> {
    self.record("set_user_role");
    let scripted = self.with_state(|s| s.set_role.next("set_user_role"));
    Self::play(scripted).await
  }

  async fn delete_user(&self, _token: &str, _id: UserId) -> Result<()> {
    self.record("delete_user");
    let scripted = self.with_state(|s| s.delete_user.next("delete_user"));
    Self::play(scripted).await
  }

  async fn subscribe_status_events(&self, _subject: &str) -> Result<StatusStream> {
    self.record("subscribe_status_events");
    match self.with_state(|s| s.push.take()) {
      Some(rx) => Ok(rx.boxed()),
      None => Err(Error::Transport("push channel unavailable".to_string())),
    }
  }
}
