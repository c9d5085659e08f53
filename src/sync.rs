//! Status synchronizer: keeps the registry consistent with the backend.
//!
//! A single task owns the [`Registry`] and the [`Session`] for one view. It
//! combines two channels:
//!
//! - **pull**: a full re-fetch through the view selector on a fixed interval,
//!   running only while some record is still unsettled;
//! - **push**: one status-event subscription per session subject, applied as
//!   rank-checked patches. Best-effort only; the pull loop is the backstop.
//!
//! Every fetch cycle is tagged with a sequence number. A result is applied only
//! if its sequence is above the last applied one, so an early-started cycle that
//! resolves late cannot overwrite a newer result.
//!
//! The task lives exactly as long as its [`SyncHandle`]; dropping the handle
//! aborts it, which releases the interval timer, the push connection and any
//! in-flight requests together.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{Backend, FeedQuery, StatusStream};
use crate::constants::constants;
use crate::error::{Error, Result};
use crate::model::{ProcessingStatus, StatusEvent, VideoId, VideoRecord};
use crate::registry::{PatchOutcome, RecordPatch, Registry, RegistryReader, Snapshot};
use crate::selector::{DataSource, Selection, ViewMode, select_source};
use crate::session::{Session, Tier};

/// User-visible, non-fatal conditions raised by the synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
  /// A fetch cycle failed; the next tick retries.
  FetchFailed(Error),
  /// The view needs a signed-in session and there is none.
  LoginRequired,
  /// The backend stopped accepting the session's credential; the session is now anonymous.
  SessionExpired,
}

/// Observable synchronizer state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
  pub mode: ViewMode,
  pub source: Option<DataSource>,
  pub tier: Tier,
  /// Whether the pull loop is currently scheduled.
  pub pulling: bool,
  pub push_connected: bool,
  /// Sequence number of the last applied fetch cycle (0 before the first).
  pub applied_sequence: u64,
}

enum Command {
  Refresh,
  SetView { mode: ViewMode, feed: FeedQuery },
  Insert { record: VideoRecord, done: oneshot::Sender<()> },
  Remove { id: VideoId, done: oneshot::Sender<()> },
}

type Cycle = BoxFuture<'static, (u64, Result<Selection>)>;

/// Clonable handle used by the mutation gateway to apply confirmed changes.
#[derive(Clone)]
pub struct SyncSender {
  commands: mpsc::Sender<Command>,
}

impl SyncSender {
  /// Insert a record the backend just accepted. Returns once it is visible.
  pub async fn insert(&self, record: VideoRecord) {
    let (done, rx) = oneshot::channel();
    if self.commands.send(Command::Insert { record, done }).await.is_ok() {
      let _ = rx.await;
    }
  }

  /// Drop a record the backend confirmed deleted. Returns once it is gone.
  pub async fn remove(&self, id: VideoId) {
    let (done, rx) = oneshot::channel();
    if self.commands.send(Command::Remove { id, done }).await.is_ok() {
      let _ = rx.await;
    }
  }

  pub async fn refresh(&self) {
    let _ = self.commands.send(Command::Refresh).await;
  }
}

/// Owning handle for a running synchronizer. Dropping it stops everything.
pub struct SyncHandle {
  sender: SyncSender,
  registry: RegistryReader,
  status: watch::Receiver<SyncStatus>,
  notices: mpsc::Receiver<Notice>,
  task: Option<JoinHandle<()>>,
}

impl SyncHandle {
  pub fn sender(&self) -> SyncSender {
    self.sender.clone()
  }

  pub fn reader(&self) -> RegistryReader {
    self.registry.clone()
  }

  pub fn snapshot(&self) -> Snapshot {
    self.registry.snapshot()
  }

  pub fn status(&self) -> SyncStatus {
    self.status.borrow().clone()
  }

  pub fn status_changes(&self) -> watch::Receiver<SyncStatus> {
    self.status.clone()
  }

  /// Issue a fetch cycle now, alongside any periodic one.
  pub async fn refresh(&self) {
    self.sender.refresh().await;
  }

  /// Switch the mirrored collection. Results of cycles for the old view are discarded.
  pub async fn set_view(&self, mode: ViewMode, feed: FeedQuery) {
    let _ = self.sender.commands.send(Command::SetView { mode, feed }).await;
  }

  pub async fn next_notice(&mut self) -> Option<Notice> {
    self.notices.recv().await
  }

  pub fn try_notice(&mut self) -> Option<Notice> {
    self.notices.try_recv().ok()
  }

  /// Stop the synchronizer and wait for its resources to be released.
  pub async fn shutdown(mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
      let _ = task.await;
    }
    debug!("sync: shut down");
  }
}

impl Drop for SyncHandle {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

/// Start synchronizing `mode` for `session`.
pub fn spawn(
  backend: Arc<dyn Backend>,
  session: Session,
  mode: ViewMode,
  feed: FeedQuery,
  interval: Duration,
) -> SyncHandle {
  let (commands_tx, commands_rx) = mpsc::channel(constants().command_capacity);
  let (notices_tx, notices_rx) = mpsc::channel(constants().notice_capacity);

  let registry = Registry::new();
  let reader = registry.reader();
  let initial = SyncStatus {
    mode,
    source: None,
    tier: session.tier(),
    pulling: false,
    push_connected: false,
    applied_sequence: 0,
  };
  let (status_tx, status_rx) = watch::channel(initial);

  let synchronizer = Synchronizer {
    backend,
    session,
    mode,
    feed,
    registry,
    interval,
    source: None,
    pull: None,
    push: None,
    connecting: None,
    issued: 0,
    applied: 0,
    outstanding: BTreeSet::new(),
    last_failed: false,
    in_flight: FuturesUnordered::new(),
    status_tx,
    notices: notices_tx,
  };
  let task = tokio::spawn(synchronizer.run(commands_rx));

  SyncHandle {
    sender: SyncSender { commands: commands_tx },
    registry: reader,
    status: status_rx,
    notices: notices_rx,
    task: Some(task),
  }
}

struct Synchronizer {
  backend: Arc<dyn Backend>,
  session: Session,
  mode: ViewMode,
  feed: FeedQuery,
  registry: Registry,
  interval: Duration,
  source: Option<DataSource>,
  pull: Option<Interval>,
  push: Option<StatusStream>,
  connecting: Option<BoxFuture<'static, Result<StatusStream>>>,
  issued: u64,
  applied: u64,
  /// Sequences issued but not yet completed, stale ones included.
  outstanding: BTreeSet<u64>,
  /// The most recent cycle failed and should be retried on the next tick.
  last_failed: bool,
  in_flight: FuturesUnordered<Cycle>,
  status_tx: watch::Sender<SyncStatus>,
  notices: mpsc::Sender<Notice>,
}

async fn tick(pull: &mut Option<Interval>) {
  match pull {
    Some(interval) => {
      interval.tick().await;
    }
    None => std::future::pending().await,
  }
}

async fn next_event(push: &mut Option<StatusStream>) -> Option<StatusEvent> {
  match push {
    Some(stream) => stream.next().await,
    None => std::future::pending().await,
  }
}

async fn connected(connecting: &mut Option<BoxFuture<'static, Result<StatusStream>>>) -> Result<StatusStream> {
  match connecting {
    Some(fut) => fut.await,
    None => std::future::pending().await,
  }
}

impl Synchronizer {
  async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
    info!(mode = ?self.mode, tier = %self.session.tier(), "sync: started");
    self.issue_cycle();
    self.connect_push();

    loop {
      tokio::select! {
        command = commands.recv() => match command {
          Some(command) => self.handle_command(command),
          None => break,
        },
        Some((seq, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
          self.complete_cycle(seq, result);
        }
        result = connected(&mut self.connecting) => {
          self.connecting = None;
          match result {
            Ok(stream) => {
              info!("push: subscribed");
              self.push = Some(stream);
            }
            Err(e) => debug!(err = %e, "push: subscription failed, continuing pull-only"),
          }
          self.publish_status();
        }
        event = next_event(&mut self.push) => match event {
          Some(event) => self.handle_event(event),
          None => {
            debug!("push: disconnected, continuing pull-only");
            self.push = None;
            self.publish_status();
          }
        },
        _ = tick(&mut self.pull) => {
          if !self.has_live_cycle() {
            self.issue_cycle();
          } else {
            debug!("sync: previous cycle still in flight, skipping tick");
          }
        }
      }
    }
    info!("sync: stopped");
  }

  fn connect_push(&mut self) {
    if self.push.is_some() || self.connecting.is_some() {
      return;
    }
    let Some(subject) = self.session.subject().map(str::to_string) else {
      return;
    };
    let backend = Arc::clone(&self.backend);
    self.connecting = Some(async move { backend.subscribe_status_events(&subject).await }.boxed());
  }

  fn issue_cycle(&mut self) {
    self.issued += 1;
    let seq = self.issued;
    let backend = Arc::clone(&self.backend);
    let session = self.session.clone();
    let mode = self.mode;
    let feed = self.feed.clone();
    debug!(seq, ?mode, "sync: fetch cycle started");
    self.outstanding.insert(seq);
    self.in_flight.push(async move { (seq, select_source(backend.as_ref(), &session, mode, &feed).await) }.boxed());
  }

  /// Everything issued so far is now stale.
  fn advance_watermark(&mut self) {
    self.applied = self.issued;
  }

  /// Whether a cycle whose result would still be applied is in flight.
  fn has_live_cycle(&self) -> bool {
    self.outstanding.range(self.applied + 1..).next().is_some()
  }

  fn complete_cycle(&mut self, seq: u64, result: Result<Selection>) {
    self.outstanding.remove(&seq);
    if seq <= self.applied {
      debug!(seq, applied = self.applied, "sync: discarding stale fetch result");
      return;
    }

    match result {
      Ok(selection) => {
        self.applied = seq;
        self.last_failed = false;
        selection.confirm(&mut self.session);
        self.source = Some(selection.source);
        self.registry.replace(selection.records);
        debug!(seq, source = %selection.source, count = self.registry.len(), "sync: fetch cycle applied");
      }
      Err(Error::Unauthenticated) => {
        self.applied = seq;
        self.last_failed = false;
        self.source = None;
        self.registry.clear();
        self.push = None;
        self.connecting = None;
        if self.session.is_authenticated() {
          self.session.invalidate();
          self.notify(Notice::SessionExpired);
        } else {
          self.notify(Notice::LoginRequired);
        }
      }
      Err(e) => {
        warn!(seq, err = %e, "sync: fetch cycle failed, retrying on the next tick");
        self.last_failed = true;
        self.notify(Notice::FetchFailed(e));
      }
    }

    self.update_pull();
    self.publish_status();
  }

  fn handle_event(&mut self, event: StatusEvent) {
    let outcome = self.registry.patch(&event.video_id, RecordPatch::status(event.status));
    debug!(video_id = %event.video_id, status = %event.status, ?outcome, "push: status event");
    if outcome != PatchOutcome::Applied {
      return;
    }
    // The event carries no storage locator; fetch it now rather than on the next tick.
    if event.status == ProcessingStatus::Completed && !self.has_live_cycle() {
      self.issue_cycle();
    }
    self.update_pull();
    self.publish_status();
  }

  fn handle_command(&mut self, command: Command) {
    let done = match command {
      Command::Refresh => {
        self.connect_push();
        self.issue_cycle();
        None
      }
      Command::SetView { mode, feed } => {
        info!(?mode, "sync: switching view");
        self.mode = mode;
        self.feed = feed;
        self.advance_watermark();
        self.source = None;
        self.registry.clear();
        self.issue_cycle();
        None
      }
      Command::Insert { record, done } => {
        if self.mode == ViewMode::PrivateLibrary {
          info!(video_id = %record.id, status = %record.status, "sync: inserting confirmed record");
          self.advance_watermark();
          self.registry.insert(record);
        } else {
          self.issue_cycle();
        }
        Some(done)
      }
      Command::Remove { id, done } => {
        self.advance_watermark();
        if self.registry.remove(&id) {
          info!(video_id = %id, "sync: removed confirmed deletion");
        }
        Some(done)
      }
    };
    self.update_pull();
    self.publish_status();
    // Acknowledge once readers can see the mutation.
    if let Some(done) = done {
      let _ = done.send(());
    }
  }

  /// Run the pull loop only while there is something left to learn, or a failed
  /// cycle to retry.
  fn update_pull(&mut self) {
    let wanted = self.registry.has_unsettled() || self.last_failed;
    match (wanted, self.pull.is_some()) {
      (true, false) => {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.pull = Some(interval);
        info!(every = ?self.interval, "sync: pull loop started");
      }
      (false, true) => {
        self.pull = None;
        info!("sync: pull loop suspended");
      }
      _ => {}
    }
  }

  fn notify(&self, notice: Notice) {
    if self.notices.try_send(notice).is_err() {
      debug!("sync: notice dropped, receiver full or gone");
    }
  }

  fn publish_status(&self) {
    self.status_tx.send_replace(SyncStatus {
      mode: self.mode,
      source: self.source,
      tier: self.session.tier(),
      pulling: self.pull.is_some(),
      push_connected: self.push.is_some(),
      applied_sequence: self.applied,
    });
  }
}
