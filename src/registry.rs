//! In-memory mirror of the active backend collection.
//!
//! Writes go through the synchronizer only. Readers hold a [`RegistryReader`]
//! and always see a whole snapshot; `replace` swaps the collection in one step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::model::{ProcessingStatus, VideoRecord};

pub type Snapshot = Arc<Vec<VideoRecord>>;

/// Field-level update carried by a push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPatch {
  pub status: ProcessingStatus,
  pub storage_key: Option<String>,
}

impl RecordPatch {
  pub fn status(status: ProcessingStatus) -> Self {
    Self { status, storage_key: None }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
  Applied,
  /// Same status and nothing new to record.
  Unchanged,
  /// Would have moved the record backward, or off a terminal status.
  Stale,
  /// No record with that id in the current view.
  Missing,
}

/// Merge an authoritative pull result over what the registry already holds.
/// Non-terminal regressions keep the local status; terminal-vs-terminal goes to the pull.
fn reconcile(existing: &VideoRecord, mut incoming: VideoRecord) -> VideoRecord {
  if incoming.status.rank() < existing.status.rank() {
    debug!(
      video_id = %incoming.id,
      local = %existing.status,
      remote = %incoming.status,
      "registry: keeping further-advanced local status"
    );
    incoming.status = existing.status;
    incoming.storage_key = existing.storage_key.clone();
  }
  incoming
}

pub struct Registry {
  records: Vec<VideoRecord>,
  tx: watch::Sender<Snapshot>,
}

impl Default for Registry {
  fn default() -> Self {
    Self::new()
  }
}

impl Registry {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(Arc::new(Vec::new()));
    Self { records: Vec::new(), tx }
  }

  pub fn reader(&self) -> RegistryReader {
    RegistryReader { rx: self.tx.subscribe() }
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn get(&self, id: &str) -> Option<&VideoRecord> {
    self.records.iter().find(|r| r.id == id)
  }

  /// Whether any record still needs the backend to tell us more.
  pub fn has_unsettled(&self) -> bool {
    self.records.iter().any(|r| !r.is_settled())
  }

  fn publish(&self) {
    self.tx.send_replace(Arc::new(self.records.clone()));
  }

  /// Swap in the result of a fetch cycle. Records missing from `records` leave the view.
  pub fn replace(&mut self, records: Vec<VideoRecord>) {
    let previous = std::mem::take(&mut self.records);
    let held: HashMap<&str, &VideoRecord> = previous.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut seen = HashSet::with_capacity(records.len());
    let mut next = Vec::with_capacity(records.len());
    for incoming in records {
      if !seen.insert(incoming.id.clone()) {
        continue;
      }
      match held.get(incoming.id.as_str()) {
        Some(existing) => next.push(reconcile(existing, incoming)),
        None => next.push(incoming),
      }
    }
    self.records = next;
    self.publish();
  }

  /// Add a record confirmed by the backend, or merge it over a copy we already hold.
  pub fn insert(&mut self, record: VideoRecord) {
    match self.records.iter().position(|r| r.id == record.id) {
      Some(idx) => {
        let merged = reconcile(&self.records[idx], record);
        self.records[idx] = merged;
      }
      None => self.records.push(record),
    }
    self.publish();
  }

  /// Apply a push-channel update. Never moves a record backward and never
  /// rewrites a terminal status.
  pub fn patch(&mut self, id: &str, patch: RecordPatch) -> PatchOutcome {
    let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
      return PatchOutcome::Missing;
    };

    let current = record.status;
    if patch.status.rank() < current.rank() || (current.is_terminal() && patch.status != current) {
      debug!(video_id = %id, local = %current, incoming = %patch.status, "registry: discarding stale patch");
      return PatchOutcome::Stale;
    }

    let key_changed = patch.storage_key.is_some() && patch.storage_key != record.storage_key;
    if patch.status == current && !key_changed {
      return PatchOutcome::Unchanged;
    }

    record.status = patch.status;
    if key_changed {
      record.storage_key = patch.storage_key;
    }
    self.publish();
    PatchOutcome::Applied
  }

  pub fn remove(&mut self, id: &str) -> bool {
    let before = self.records.len();
    self.records.retain(|r| r.id != id);
    let removed = self.records.len() != before;
    if removed {
      self.publish();
    }
    removed
  }

  pub fn clear(&mut self) {
    if !self.records.is_empty() {
      self.records.clear();
      self.publish();
    }
  }
}

/// Read-only view of the registry that outlives individual snapshots.
#[derive(Clone)]
pub struct RegistryReader {
  rx: watch::Receiver<Snapshot>,
}

impl RegistryReader {
  pub fn snapshot(&self) -> Snapshot {
    self.rx.borrow().clone()
  }

  /// Wait for the next published snapshot. `None` once the registry is gone.
  pub async fn changed(&mut self) -> Option<Snapshot> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::fixtures::video;
  use ProcessingStatus::*;

  fn status_of(registry: &Registry, id: &str) -> ProcessingStatus {
    registry.get(id).map(|r| r.status).unwrap()
  }

  #[test]
  fn patch_missing_record_is_noop() {
    let mut registry = Registry::new();
    assert_eq!(registry.patch("ghost", RecordPatch::status(Completed)), PatchOutcome::Missing);
    assert!(registry.is_empty());
  }

  #[test]
  fn out_of_order_patches_keep_highest_rank() {
    let orders = [
      [Pending, Processing, Completed],
      [Pending, Completed, Processing],
      [Processing, Pending, Completed],
      [Processing, Completed, Pending],
      [Completed, Pending, Processing],
      [Completed, Processing, Pending],
    ];
    for order in orders {
      let mut registry = Registry::new();
      registry.replace(vec![video("a", Pending)]);
      for status in order {
        registry.patch("a", RecordPatch::status(status));
      }
      assert_eq!(status_of(&registry, "a"), Completed, "order {:?}", order);
    }
  }

  #[test]
  fn push_cannot_overturn_terminal_status() {
    let mut registry = Registry::new();
    registry.replace(vec![video("a", Failed)]);
    assert_eq!(registry.patch("a", RecordPatch::status(Completed)), PatchOutcome::Stale);
    assert_eq!(status_of(&registry, "a"), Failed);
  }

  #[test]
  fn pull_wins_terminal_conflicts() {
    let mut registry = Registry::new();
    registry.replace(vec![video("a", Processing)]);
    registry.patch("a", RecordPatch::status(Completed));
    registry.replace(vec![video("a", Failed)]);
    assert_eq!(status_of(&registry, "a"), Failed);
  }

  #[test]
  fn pull_does_not_regress_non_terminal_status() {
    let mut registry = Registry::new();
    registry.replace(vec![video("a", Pending)]);
    registry.patch("a", RecordPatch::status(Processing));
    registry.replace(vec![video("a", Pending)]);
    assert_eq!(status_of(&registry, "a"), Processing);
  }

  #[test]
  fn replace_drops_records_outside_the_view() {
    let mut registry = Registry::new();
    registry.replace(vec![video("a", Pending), video("b", Completed)]);
    registry.replace(vec![video("b", Completed)]);
    assert_eq!(registry.len(), 1);
    assert!(registry.get("a").is_none());
  }

  #[test]
  fn replace_deduplicates_ids() {
    let mut registry = Registry::new();
    registry.replace(vec![video("a", Pending), video("a", Processing)]);
    assert_eq!(registry.len(), 1);
    assert_eq!(status_of(&registry, "a"), Pending);
  }

  #[test]
  fn replace_matches_records_by_id_in_any_order() {
    let mut registry = Registry::new();
    let ids: Vec<String> = (0..200).map(|i| format!("v{i}")).collect();
    registry.replace(ids.iter().map(|id| video(id, Processing)).collect());

    let mut reversed: Vec<VideoRecord> = ids.iter().rev().map(|id| video(id, Pending)).collect();
    reversed[0].status = Completed;
    registry.replace(reversed);

    assert_eq!(registry.len(), 200);
    assert_eq!(status_of(&registry, "v199"), Completed);
    assert_eq!(status_of(&registry, "v0"), Processing);
    assert_eq!(registry.reader().snapshot()[0].id, "v199");
  }

  #[test]
  fn insert_merges_with_existing_copy() {
    let mut registry = Registry::new();
    registry.replace(vec![video("a", Processing)]);
    registry.insert(video("a", Pending));
    assert_eq!(registry.len(), 1);
    assert_eq!(status_of(&registry, "a"), Processing);
  }

  #[test]
  fn remove_publishes_only_on_change() {
    let mut registry = Registry::new();
    registry.replace(vec![video("a", Pending)]);
    let mut reader = registry.reader();
    assert!(!registry.remove("zzz"));
    assert!(!reader.rx.has_changed().unwrap());
    assert!(registry.remove("a"));
    assert!(reader.rx.has_changed().unwrap());
    assert!(reader.snapshot().is_empty());
    let _ = reader.rx.borrow_and_update();
  }

  #[test]
  fn unsettled_tracks_pending_work() {
    let mut registry = Registry::new();
    registry.replace(vec![video("a", Completed), video("b", Failed)]);
    assert!(!registry.has_unsettled());
    registry.insert(video("c", Pending));
    assert!(registry.has_unsettled());
  }

  #[tokio::test]
  async fn readers_see_whole_snapshots() {
    let mut registry = Registry::new();
    let mut reader = registry.reader();
    registry.replace(vec![video("a", Pending), video("b", Pending)]);
    let snapshot = reader.changed().await.unwrap();
    assert_eq!(snapshot.len(), 2);
  }
}
