//! In-memory tables and busy-state tracking for one engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

use super::{Entity, StoredRecord};
use crate::owner::SourceOwner;

/// Engine state as seen by the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatus {
  pub initialized: bool,
  /// A batch update or at least one single-owner refresh is running.
  pub is_updating: bool,
  /// Aggregate message for the last failed operation, if any.
  pub error: Option<String>,
  /// Owner keys whose last fetch failed.
  pub failed_owners: Vec<String>,
}

/// One owner's visibility set, persisted under the owner key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerVisibility {
  pub owner: SourceOwner,
  pub endpoint: String,
  pub ids: BTreeSet<i64>,
}

/// Deduplicated item table plus per-owner visibility sets.
pub(crate) struct EngineState<T> {
  pub items: BTreeMap<i64, StoredRecord<T>>,
  pub visibility: BTreeMap<String, OwnerVisibility>,
}

impl<T> Default for EngineState<T> {
  fn default() -> Self {
    Self {
      items: BTreeMap::new(),
      visibility: BTreeMap::new(),
    }
  }
}

impl<T: Entity> EngineState<T> {
  /// Replace an owner's visibility set with `records` and upsert each record.
  ///
  /// Returns the previous visibility entry and the ids whose stored record
  /// changed and needs persisting.
  pub fn merge_owner(
    &mut self,
    visibility: OwnerVisibility,
    records: &[T],
    update_existing: bool,
  ) -> (Option<OwnerVisibility>, Vec<i64>) {
    let mut touched = Vec::with_capacity(records.len());

    for record in records {
      let id = record.record_id();
      if !update_existing && self.items.contains_key(&id) {
        continue;
      }
      self.items.insert(
        id,
        StoredRecord {
          item: record.clone(),
          source: visibility.owner,
        },
      );
      touched.push(id);
    }

    let key = visibility.owner.key();
    let previous = self.visibility.insert(key, visibility);
    (previous, touched)
  }

  /// Union of every owner's visibility set.
  pub fn live_ids(&self) -> BTreeSet<i64> {
    self
      .visibility
      .values()
      .flat_map(|v| v.ids.iter().copied())
      .collect()
  }

  /// Drop every record no owner can see. Returns the removed ids.
  pub fn collect_garbage(&mut self) -> Vec<i64> {
    let live = self.live_ids();
    let dead: Vec<i64> = self
      .items
      .keys()
      .filter(|id| !live.contains(id))
      .copied()
      .collect();
    for id in &dead {
      self.items.remove(id);
    }
    dead
  }
}

/// Busy flags for one engine, mirrored into a watch channel.
pub(crate) struct Activity {
  batch: AtomicBool,
  owners: Mutex<HashSet<String>>,
  status: watch::Sender<EngineStatus>,
}

impl Activity {
  pub fn new() -> Self {
    let (status, _) = watch::channel(EngineStatus::default());
    Self {
      batch: AtomicBool::new(false),
      owners: Mutex::new(HashSet::new()),
      status,
    }
  }

  fn owners(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
    self.owners.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn is_busy(&self) -> bool {
    self.batch.load(Ordering::SeqCst) || !self.owners().is_empty()
  }

  #[cfg(test)]
  pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
    self.status.subscribe()
  }

  pub fn snapshot(&self) -> EngineStatus {
    self.status.borrow().clone()
  }

  /// Apply a change to the published status, refreshing `is_updating`.
  pub fn publish(&self, change: impl FnOnce(&mut EngineStatus)) {
    let busy = self.is_busy();
    self.status.send_if_modified(|status| {
      let before = status.clone();
      change(status);
      status.is_updating = busy;
      *status != before
    });
  }

  /// Start a batch update, or `None` if one is already running.
  pub fn begin_batch(&self) -> Option<BatchGuard<'_>> {
    if self.batch.swap(true, Ordering::SeqCst) {
      return None;
    }
    self.publish(|_| {});
    Some(BatchGuard { activity: self })
  }

  /// Start work on one owner, or `None` if that owner is already in flight.
  pub fn begin_owner(&self, owner_key: &str) -> Option<OwnerGuard<'_>> {
    if !self.owners().insert(owner_key.to_string()) {
      return None;
    }
    self.publish(|_| {});
    Some(OwnerGuard {
      activity: self,
      owner_key: owner_key.to_string(),
    })
  }
}

/// Clears the batch flag when dropped, including on early return or panic.
pub(crate) struct BatchGuard<'a> {
  activity: &'a Activity,
}

impl Drop for BatchGuard<'_> {
  fn drop(&mut self) {
    self.activity.batch.store(false, Ordering::SeqCst);
    self.activity.publish(|_| {});
  }
}

/// Releases an owner's in-flight slot when dropped.
pub(crate) struct OwnerGuard<'a> {
  activity: &'a Activity,
  owner_key: String,
}

impl Drop for OwnerGuard<'_> {
  fn drop(&mut self) {
    self.activity.owners().remove(&self.owner_key);
    self.activity.publish(|_| {});
  }
}
