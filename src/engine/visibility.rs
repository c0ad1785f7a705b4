//! The generic engine: fetch per owner, merge, persist, collect garbage.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::config::EngineConfig;
use super::state::{Activity, EngineState, EngineStatus, OwnerVisibility};
use super::{Entity, FetchOutcome, Outcome, StoredRecord};
use crate::esi::EsiError;
use crate::expiry::{ExpiryRegistry, RefreshSubscription};
use crate::owner::{owner_key, Owner, OwnerDirectory, OwnerKind};
use crate::store::KeyValueStore;

/// How one owner's fetch cycle ended.
enum OwnerSync<T> {
  Updated(super::OwnerUpdate<T>),
  Unchanged,
  Skipped,
  Failed,
}

/// Deduplicating, owner-scoped mirror of one entity kind.
pub struct VisibilityEngine<T: Entity, S: KeyValueStore> {
  config: EngineConfig<T>,
  store: Arc<S>,
  expiry: Arc<ExpiryRegistry<S>>,
  directory: Arc<dyn OwnerDirectory>,
  state: Mutex<EngineState<T>>,
  init_lock: tokio::sync::Mutex<()>,
  activity: Activity,
}

impl<T: Entity, S: KeyValueStore + 'static> VisibilityEngine<T, S> {
  /// Build an engine. Fails only on missing required parameters.
  pub fn new(
    config: EngineConfig<T>,
    store: Arc<S>,
    expiry: Arc<ExpiryRegistry<S>>,
    directory: Arc<dyn OwnerDirectory>,
  ) -> Result<Arc<Self>> {
    config.validate()?;

    Ok(Arc::new(Self {
      config,
      store,
      expiry,
      directory,
      state: Mutex::new(EngineState::default()),
      init_lock: tokio::sync::Mutex::new(()),
      activity: Activity::new(),
    }))
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  fn items_collection(&self) -> String {
    format!("{}:items", self.config.name)
  }

  fn visibility_collection(&self) -> String {
    format!("{}:visibility", self.config.name)
  }

  fn state(&self) -> MutexGuard<'_, EngineState<T>> {
    // Mutations never leave the maps half-written, so recover from poisoning.
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn endpoint(&self, owner: &Owner) -> String {
    self.config.endpoint.as_ref().map_or_else(String::new, |f| f(owner))
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  pub fn status(&self) -> EngineStatus {
    self.activity.snapshot()
  }

  pub fn is_initialized(&self) -> bool {
    self.activity.snapshot().initialized
  }

  pub fn is_updating(&self) -> bool {
    self.activity.is_busy()
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub fn record(&self, id: i64) -> Option<StoredRecord<T>> {
    self.state().items.get(&id).cloned()
  }

  pub fn record_ids(&self) -> BTreeSet<i64> {
    self.state().items.keys().copied().collect()
  }

  pub fn len(&self) -> usize {
    self.state().items.len()
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Load persisted records and visibility sets.
  ///
  /// Idempotent and single-flight: concurrent callers wait for the first
  /// load. Fails open: a storage error leaves the engine ready and empty.
  pub async fn init(&self) {
    if self.is_initialized() {
      return;
    }
    let _init = self.init_lock.lock().await;
    if self.is_initialized() {
      return;
    }

    let loaded = match self.load_persisted() {
      Ok(state) => state,
      Err(e) => {
        error!(engine = %self.name(), error = %e, "Failed to load persisted state, starting empty");
        EngineState::default()
      }
    };

    let records: Vec<T> = loaded.items.values().map(|r| r.item.clone()).collect();
    info!(
      engine = %self.name(),
      records = records.len(),
      owners = loaded.visibility.len(),
      "Engine initialized"
    );
    *self.state() = loaded;
    self.activity.publish(|s| s.initialized = true);

    if !records.is_empty() {
      if let Some(hook) = &self.config.after_init {
        hook(&records);
      }
    }
  }

  fn load_persisted(&self) -> Result<EngineState<T>> {
    let mut state = EngineState::default();

    for (_, record) in self
      .store
      .get_all::<StoredRecord<T>>(&self.items_collection())?
    {
      state.items.insert(record.item.record_id(), record);
    }

    for (key, visibility) in self
      .store
      .get_all::<OwnerVisibility>(&self.visibility_collection())?
    {
      state.visibility.insert(key, visibility);
    }

    Ok(state)
  }

  /// Refresh every candidate owner, one at a time.
  ///
  /// No-op when a batch is already running. Without `force`, only owners
  /// whose expiry has passed are fetched. When nothing is due the status is
  /// left as it was and the outcome is empty.
  pub async fn update(&self, force: bool) -> Outcome {
    let Some(_batch) = self.activity.begin_batch() else {
      debug!(engine = %self.name(), "Update already running");
      return Outcome::default();
    };

    self.init().await;

    let candidates = self.candidates(force);
    if candidates.is_empty() {
      debug!(engine = %self.name(), force, "No owners to update");
      return Outcome::default();
    }

    info!(engine = %self.name(), owners = candidates.len(), force, "Updating");

    let mut attempted = 0;
    let mut failed = Vec::new();
    let mut updates = Vec::new();

    for owner in &candidates {
      let key = owner.key();
      let Some(_owner) = self.activity.begin_owner(&key) else {
        debug!(engine = %self.name(), owner = %key, "Owner refresh already in flight");
        continue;
      };

      attempted += 1;
      match self.sync_owner(owner).await {
        OwnerSync::Updated(update) => updates.push(update),
        OwnerSync::Unchanged | OwnerSync::Skipped => {}
        OwnerSync::Failed => failed.push(key),
      }
    }

    if self.config.should_delete_stale_items {
      self.collect_garbage();
    }

    let error = if !failed.is_empty() && failed.len() == attempted {
      Some(format!("Failed to fetch any {}", self.name()))
    } else if !failed.is_empty() {
      Some(format!("Failed to fetch {} for some owners", self.name()))
    } else {
      None
    };
    if let Some(message) = &error {
      warn!(engine = %self.name(), failed = ?failed, "{}", message);
    }
    let reported = error.clone();
    self.activity.publish(|s| {
      s.error = reported;
      s.failed_owners = failed;
    });

    let changed = !updates.is_empty();
    if changed {
      if let Some(hook) = &self.config.after_batch_update {
        hook(&updates);
      }
    }
    Outcome { changed, error }
  }

  /// Refresh a single owner.
  ///
  /// At most one refresh per owner key runs at a time; a second call while
  /// one is in flight returns immediately.
  pub async fn update_for_owner(&self, owner: &Owner) -> Outcome {
    let key = owner.key();
    let Some(_owner) = self.activity.begin_owner(&key) else {
      debug!(engine = %self.name(), owner = %key, "Owner refresh already in flight");
      return Outcome::default();
    };

    self.init().await;

    if !self.config.applies_to(owner) {
      debug!(engine = %self.name(), owner = %key, "Owner not applicable");
      return Outcome::default();
    }

    match self.sync_owner(owner).await {
      OwnerSync::Updated(update) => {
        if self.config.should_delete_stale_items {
          self.collect_garbage();
        }
        self.clear_owner_failure(&key);
        if let Some(hook) = &self.config.after_owner_update {
          hook(&update);
        }
        Outcome {
          changed: true,
          error: None,
        }
      }
      OwnerSync::Unchanged | OwnerSync::Skipped => {
        self.clear_owner_failure(&key);
        Outcome::default()
      }
      OwnerSync::Failed => {
        let message = format!("Failed to fetch {} for {}", self.name(), key);
        let reported = message.clone();
        self.activity.publish(|s| {
          if !s.failed_owners.contains(&key) {
            s.failed_owners.push(key.clone());
          }
          s.error = Some(reported);
        });
        Outcome {
          changed: false,
          error: Some(message),
        }
      }
    }
  }

  /// Resolve an owner key through the directory and refresh it.
  pub async fn refresh_owner_key(&self, owner_key: &str) {
    match self.directory.find(owner_key) {
      Some(owner) if owner.auth_failed => {
        debug!(engine = %self.name(), owner = %owner_key, "Skipping refresh, credentials rejected");
      }
      Some(owner) => {
        let outcome = self.update_for_owner(&owner).await;
        debug!(engine = %self.name(), owner = %owner_key, changed = outcome.changed, "Refreshed owner");
      }
      None => debug!(engine = %self.name(), owner = %owner_key, "Refresh for unknown owner"),
    }
  }

  /// Bind `refresh_owner_key` to the expiry registry for endpoints
  /// containing `pattern`.
  pub fn register_refresh(self: &Arc<Self>, pattern: &str) -> RefreshSubscription {
    let engine = Arc::downgrade(self);
    self.expiry.register_refresh_callback(pattern, move |key| {
      let engine = engine.clone();
      async move {
        if let Some(engine) = engine.upgrade() {
          engine.refresh_owner_key(&key).await;
        }
      }
    })
  }

  /// Drop an owner's visibility set, the records only it could see, and
  /// its expiry records. Nothing changes if the owner had no data here.
  pub async fn remove_for_owner(&self, kind: OwnerKind, id: i64) -> Outcome {
    let key = owner_key(kind, id);

    let removed = self.state().visibility.remove(&key);
    if removed.is_none() {
      return Outcome::default();
    }

    let mut errors = Vec::new();
    if let Err(e) = self.store.delete(&self.visibility_collection(), &key) {
      errors.push(e);
    }
    if self.config.should_delete_stale_items {
      if let Err(e) = self.delete_garbage() {
        errors.push(e);
      }
    }
    if let Err(e) = self.expiry.clear_for_owner(&key) {
      errors.push(e);
    }

    info!(engine = %self.name(), owner = %key, "Removed owner");

    for e in &errors {
      error!(engine = %self.name(), owner = %key, error = %e, "Failed to persist owner removal");
    }
    let message = format!("Failed to remove {} for {}", self.name(), key);
    let error = (!errors.is_empty()).then(|| message.clone());
    self.activity.publish(|s| {
      s.failed_owners.retain(|k| k != &key);
      if error.is_some() {
        s.error = Some(message);
      } else if s.error.as_deref() == Some(message.as_str()) {
        s.error = None;
      }
    });
    Outcome {
      changed: true,
      error,
    }
  }

  /// Wipe persisted and in-memory state. The next `init` starts fresh.
  pub async fn clear(&self) -> Outcome {
    let _init = self.init_lock.lock().await;

    let endpoints: Vec<(String, String)> = {
      let mut state = self.state();
      let endpoints = state
        .visibility
        .iter()
        .map(|(k, v)| (k.clone(), v.endpoint.clone()))
        .collect();
      *state = EngineState::default();
      endpoints
    };

    let mut failed = false;
    for collection in [self.items_collection(), self.visibility_collection()] {
      if let Err(e) = self.store.clear(&collection) {
        error!(engine = %self.name(), collection = %collection, error = %e, "Failed to clear collection");
        failed = true;
      }
    }
    for (key, endpoint) in &endpoints {
      if let Err(e) = self.expiry.clear_endpoint(key, endpoint) {
        error!(engine = %self.name(), owner = %key, error = %e, "Failed to clear expiry");
        failed = true;
      }
    }

    info!(engine = %self.name(), "Cleared");
    let error = failed.then(|| format!("Failed to clear {}", self.name()));
    let reported = error.clone();
    self.activity.publish(|s| {
      *s = EngineStatus::default();
      s.error = reported;
    });
    Outcome {
      changed: true,
      error,
    }
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  /// Owners to fetch in this batch, in directory order.
  fn candidates(&self, force: bool) -> Vec<Owner> {
    self
      .directory
      .list_owners()
      .into_iter()
      .filter(|o| !o.auth_failed && self.config.applies_to(o))
      .filter(|o| force || self.expiry.is_expired(&o.key(), &self.endpoint(o)))
      .collect()
  }

  /// Fetch, merge, persist and record expiry for one owner.
  async fn sync_owner(&self, owner: &Owner) -> OwnerSync<T> {
    let key = owner.key();
    let endpoint = self.endpoint(owner);

    // Only revalidate when there is something to keep on a 304.
    let etag = if self.state().visibility.contains_key(&key) {
      self.expiry.get(&key, &endpoint).and_then(|r| r.etag)
    } else {
      None
    };

    let fetcher = match &self.config.fetcher {
      Some(f) => f.clone(),
      None => return OwnerSync::Failed,
    };

    match fetcher(owner.clone(), etag).await {
      Ok(FetchOutcome::NotModified { expires_at, etag }) => {
        debug!(engine = %self.name(), owner = %key, "Not modified");
        let is_empty = self
          .expiry
          .get(&key, &endpoint)
          .map_or(false, |r| r.is_empty);
        if let Err(e) = self
          .expiry
          .set_expiry(&key, &endpoint, expires_at, etag, is_empty)
        {
          error!(engine = %self.name(), owner = %key, error = %e, "Failed to record expiry");
        }
        OwnerSync::Unchanged
      }
      Ok(FetchOutcome::Modified {
        records,
        expires_at,
        etag,
      }) => {
        let is_empty = (self.config.is_empty)(&records);
        let visibility = OwnerVisibility {
          owner: owner.source(),
          endpoint: endpoint.clone(),
          ids: records.iter().map(Entity::record_id).collect(),
        };

        let (previous, touched) = self.state().merge_owner(
          visibility.clone(),
          &records,
          self.config.should_update_existing,
        );

        if let Err(e) = self.persist_owner(&key, &visibility, &touched) {
          // Memory stays ahead of disk. Expiry is not advanced, so the next
          // sweep refetches this owner and rewrites it.
          error!(engine = %self.name(), owner = %key, error = %e, "Failed to persist fetch result");
          return OwnerSync::Failed;
        }

        if let Err(e) = self
          .expiry
          .set_expiry(&key, &endpoint, expires_at, etag, is_empty)
        {
          error!(engine = %self.name(), owner = %key, error = %e, "Failed to record expiry");
        }

        debug!(engine = %self.name(), owner = %key, records = records.len(), "Merged");
        OwnerSync::Updated(super::OwnerUpdate {
          owner: owner.clone(),
          records,
          previous_ids: previous.map(|p| p.ids).unwrap_or_default(),
        })
      }
      Err(report) => self.classify_failure(owner, report),
    }
  }

  fn classify_failure(&self, owner: &Owner, report: color_eyre::Report) -> OwnerSync<T> {
    let key = owner.key();
    match report.downcast_ref::<EsiError>() {
      Some(EsiError::NotInCorporation { .. }) => {
        debug!(engine = %self.name(), owner = %key, "No longer a member, skipping");
        OwnerSync::Skipped
      }
      Some(EsiError::Unauthorized { .. } | EsiError::Forbidden { .. }) => {
        self.directory.mark_auth_failed(&key);
        warn!(engine = %self.name(), owner = %key, error = %report, "Fetch failed");
        OwnerSync::Failed
      }
      _ => {
        warn!(engine = %self.name(), owner = %key, error = %report, "Fetch failed");
        OwnerSync::Failed
      }
    }
  }

  fn persist_owner(&self, key: &str, visibility: &OwnerVisibility, touched: &[i64]) -> Result<()> {
    self
      .store
      .put(&self.visibility_collection(), key, visibility)?;

    let entries: Vec<(String, StoredRecord<T>)> = {
      let state = self.state();
      touched
        .iter()
        .filter_map(|id| state.items.get(id).map(|r| (id.to_string(), r.clone())))
        .collect()
    };
    self.store.put_batch(&self.items_collection(), &entries)
  }

  /// Remove unreferenced records from memory and disk.
  fn delete_garbage(&self) -> Result<usize> {
    let dead = self.state().collect_garbage();
    if dead.is_empty() {
      return Ok(0);
    }

    let keys: Vec<String> = dead.iter().map(i64::to_string).collect();
    self
      .store
      .delete_batch(&self.items_collection(), &keys)
      .map_err(|e| eyre!("Failed to delete {} stale records: {}", keys.len(), e))?;

    debug!(engine = %self.name(), removed = dead.len(), "Collected garbage");
    Ok(dead.len())
  }

  fn collect_garbage(&self) {
    if let Err(e) = self.delete_garbage() {
      error!(engine = %self.name(), error = %e, "Garbage collection failed");
    }
  }

  fn clear_owner_failure(&self, key: &str) {
    self.activity.publish(|s| {
      s.failed_owners.retain(|k| k != key);
      if s.failed_owners.is_empty() {
        s.error = None;
      }
    });
  }

  /// Visibility sets keyed by owner.
  pub fn visibility_map(&self) -> BTreeMap<String, BTreeSet<i64>> {
    self
      .state()
      .visibility
      .iter()
      .map(|(k, v)| (k.clone(), v.ids.clone()))
      .collect()
  }
}

#[cfg(test)]
impl<T: Entity, S: KeyValueStore + 'static> VisibilityEngine<T, S> {
  pub fn subscribe(&self) -> tokio::sync::watch::Receiver<EngineStatus> {
    self.activity.subscribe()
  }

  pub fn records(&self) -> Vec<T> {
    self.state().items.values().map(|r| r.item.clone()).collect()
  }

  pub fn is_empty(&self) -> bool {
    self.state().items.is_empty()
  }

  pub fn visible_ids(&self, owner_key: &str) -> Option<BTreeSet<i64>> {
    self.state().visibility.get(owner_key).map(|v| v.ids.clone())
  }

  pub fn owner_keys(&self) -> Vec<String> {
    self.state().visibility.keys().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::testing::*;
  use crate::engine::OwnerUpdate;
  use chrono::{Duration, Utc};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn three_characters() -> Vec<Owner> {
    vec![
      Owner::character(1, "One"),
      Owner::character(2, "Two"),
      Owner::character(3, "Three"),
    ]
  }

  // --------------------------------------------------------------------------
  // Scenarios
  // --------------------------------------------------------------------------

  #[tokio::test]
  async fn test_scenario_shared_record_stored_once() {
    let (_h, engine) = scenario_a().await;

    assert_eq!(engine.record_ids(), ids(&[100, 101, 102]));
    assert_eq!(engine.visible_ids("character-1"), Some(ids(&[100, 101])));
    assert_eq!(engine.visible_ids("character-2"), Some(ids(&[100, 102])));
    assert_eq!(engine.len(), 3);
    assert!(engine.status().initialized);
    assert!(engine.status().error.is_none());
  }

  #[tokio::test]
  async fn test_scenario_remove_owner_collects_unshared_records() {
    let (h, engine) = scenario_a().await;

    assert!(engine.remove_for_owner(OwnerKind::Character, 1).await.changed);

    assert_eq!(engine.owner_keys(), vec!["character-2".to_string()]);
    assert_eq!(engine.record_ids(), ids(&[100, 102]));
    assert!(h.expiry.endpoints_for("character-1").is_empty());
    assert!(!h.expiry.endpoints_for("character-2").is_empty());

    // Disk agrees with memory.
    let reloaded = h.engine();
    reloaded.init().await;
    assert_eq!(reloaded.record_ids(), ids(&[100, 102]));
    assert_eq!(reloaded.owner_keys(), vec!["character-2".to_string()]);
  }

  #[tokio::test]
  async fn test_scenario_clear_resets_everything() {
    let (h, engine) = scenario_a().await;

    engine.clear().await;

    assert!(engine.is_empty());
    assert!(engine.owner_keys().is_empty());
    assert!(!engine.status().initialized);
    assert!(h.expiry.endpoints_for("character-1").is_empty());

    engine.init().await;
    assert!(engine.status().initialized);
    assert!(engine.is_empty());

    // Cleared expiry means a plain update refetches everyone.
    engine.update(false).await;
    assert_eq!(engine.record_ids(), ids(&[100, 101, 102]));
  }

  // --------------------------------------------------------------------------
  // Invariants
  // --------------------------------------------------------------------------

  #[tokio::test]
  async fn test_every_record_is_visible_to_some_owner() {
    let (h, engine) = scenario_a().await;

    h.upstream.reply("character-1", Reply::Records(items(&[101])));
    h.upstream.reply("character-2", Reply::Records(items(&[103])));
    engine.update(true).await;

    let live: BTreeSet<i64> = engine
      .visibility_map()
      .values()
      .flat_map(|s| s.iter().copied())
      .collect();
    assert_eq!(engine.record_ids(), live);
    assert_eq!(engine.record_ids(), ids(&[101, 103]));
  }

  #[tokio::test]
  async fn test_refetch_is_idempotent() {
    let (h, engine) = scenario_a().await;
    let records = engine.records();
    let visibility = engine.visibility_map();

    engine.update(true).await;

    assert_eq!(engine.records(), records);
    assert_eq!(engine.visibility_map(), visibility);
    assert_eq!(h.store.inner.len("things:items"), 3);
    assert_eq!(h.store.inner.len("things:visibility"), 2);
  }

  #[tokio::test]
  async fn test_update_existing_disabled_keeps_first_seen() {
    let h = Harness::new(vec![Owner::character(1, "One"), Owner::character(2, "Two")]);
    h.upstream.reply(
      "character-1",
      Reply::Records(vec![Item {
        id: 100,
        label: "first".to_string(),
      }]),
    );
    h.upstream.reply(
      "character-2",
      Reply::Records(vec![Item {
        id: 100,
        label: "second".to_string(),
      }]),
    );
    let engine = h.engine_with(h.config().update_existing(false));

    engine.update(true).await;

    let stored = engine.record(100).unwrap();
    assert_eq!(stored.item.label, "first");
    assert_eq!(stored.source.id, 1);
  }

  #[tokio::test]
  async fn test_stale_deletion_disabled_keeps_records() {
    let h = Harness::new(vec![Owner::character(1, "One")]);
    h.upstream.reply("character-1", Reply::Records(items(&[1, 2])));
    let engine = h.engine_with(h.config().delete_stale_items(false));
    engine.update(true).await;

    h.upstream.reply("character-1", Reply::Records(items(&[2])));
    engine.update(true).await;
    assert_eq!(engine.record_ids(), ids(&[1, 2]));

    engine.remove_for_owner(OwnerKind::Character, 1).await;
    assert_eq!(engine.record_ids(), ids(&[1, 2]));
  }

  // --------------------------------------------------------------------------
  // Staleness and conditional requests
  // --------------------------------------------------------------------------

  #[tokio::test]
  async fn test_fresh_owners_are_skipped_unless_forced() {
    let (h, engine) = scenario_a().await;
    assert_eq!(h.upstream.calls().len(), 2);

    engine.update(false).await;
    assert_eq!(h.upstream.calls().len(), 2);

    // Expire only character-2.
    h.expiry
      .set_expiry(
        "character-2",
        "/characters/2/things/",
        Utc::now() - Duration::milliseconds(1),
        None,
        false,
      )
      .unwrap();
    engine.update(false).await;
    let calls = h.upstream.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].0, "character-2");

    engine.update(true).await;
    assert_eq!(h.upstream.calls().len(), 5);
  }

  #[tokio::test]
  async fn test_etag_is_sent_only_with_existing_data() {
    let h = Harness::new(vec![Owner::character(1, "One")]);
    h.upstream.reply("character-1", Reply::Records(items(&[1])));
    let engine = h.engine();

    engine.update(true).await;
    engine.update(true).await;

    let calls = h.upstream.calls();
    assert_eq!(calls[0].1, None);
    assert_eq!(calls[1].1.as_deref(), Some("\"etag-character-1\""));
  }

  #[tokio::test]
  async fn test_not_modified_keeps_data_and_advances_expiry() {
    let (h, engine) = scenario_a().await;
    let before = h
      .expiry
      .get("character-1", "/characters/1/things/")
      .unwrap()
      .expires_at;

    h.upstream.reply("character-1", Reply::NotModified);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    engine.update(true).await;

    assert_eq!(engine.visible_ids("character-1"), Some(ids(&[100, 101])));
    assert_eq!(engine.record_ids(), ids(&[100, 101, 102]));
    let after = h
      .expiry
      .get("character-1", "/characters/1/things/")
      .unwrap()
      .expires_at;
    assert!(after > before);
  }

  #[tokio::test]
  async fn test_empty_result_is_recorded() {
    let h = Harness::new(vec![Owner::character(1, "One")]);
    let engine = h.engine();
    engine.update(true).await;

    let record = h.expiry.get("character-1", "/characters/1/things/").unwrap();
    assert!(record.is_empty);
    assert_eq!(engine.visible_ids("character-1"), Some(BTreeSet::new()));
  }

  // --------------------------------------------------------------------------
  // Failures
  // --------------------------------------------------------------------------

  #[tokio::test]
  async fn test_one_failing_owner_does_not_abort_batch() {
    let h = Harness::new(three_characters());
    h.upstream.reply("character-1", Reply::Records(items(&[1])));
    h.upstream.reply("character-2", Reply::Fail);
    h.upstream.reply("character-3", Reply::Records(items(&[3])));
    let engine = h.engine();

    engine.update(true).await;

    let status = engine.status();
    assert_eq!(engine.record_ids(), ids(&[1, 3]));
    assert_eq!(status.failed_owners, vec!["character-2".to_string()]);
    assert_eq!(
      status.error.as_deref(),
      Some("Failed to fetch things for some owners")
    );
    assert!(!status.is_updating);
  }

  #[tokio::test]
  async fn test_total_failure_is_reported_once() {
    let h = Harness::new(three_characters());
    for key in ["character-1", "character-2", "character-3"] {
      h.upstream.reply(key, Reply::Fail);
    }
    let engine = h.engine();

    engine.update(true).await;

    let status = engine.status();
    assert_eq!(status.error.as_deref(), Some("Failed to fetch any things"));
    assert_eq!(status.failed_owners.len(), 3);
    assert!(engine.is_empty());
  }

  #[tokio::test]
  async fn test_not_member_is_a_silent_skip() {
    let h = Harness::new(vec![
      Owner::character(1, "One"),
      Owner::corporation(98, 1, "Corp"),
    ]);
    h.upstream.reply("character-1", Reply::Records(items(&[1])));
    h.upstream.reply("corporation-98", Reply::NotMember);
    let engine = h.engine();

    engine.update(true).await;

    let status = engine.status();
    assert!(status.error.is_none());
    assert!(status.failed_owners.is_empty());
    assert_eq!(engine.record_ids(), ids(&[1]));
  }

  #[tokio::test]
  async fn test_rejected_credentials_exclude_owner_from_later_batches() {
    let h = Harness::new(vec![Owner::character(1, "One"), Owner::character(2, "Two")]);
    h.upstream.reply("character-1", Reply::Unauthorized);
    h.upstream.reply("character-2", Reply::Records(items(&[2])));
    let engine = h.engine();

    engine.update(true).await;
    assert_eq!(engine.status().failed_owners, vec!["character-1".to_string()]);

    engine.update(true).await;
    let calls: Vec<String> = h.upstream.calls().into_iter().map(|(k, _)| k).collect();
    assert_eq!(calls, vec!["character-1", "character-2", "character-2"]);
    assert!(engine.status().failed_owners.is_empty());
  }

  #[tokio::test]
  async fn test_write_failure_keeps_memory_and_leaves_owner_expired() {
    let h = Harness::new(vec![Owner::character(1, "One")]);
    h.upstream.reply("character-1", Reply::Records(items(&[1, 2])));
    let engine = h.engine();
    engine.init().await;

    h.store.fail_writes.store(true, Ordering::SeqCst);
    engine.update(false).await;

    assert_eq!(engine.record_ids(), ids(&[1, 2]));
    assert_eq!(engine.status().failed_owners, vec!["character-1".to_string()]);
    assert!(h.expiry.is_expired("character-1", "/characters/1/things/"));

    // Next successful write reconciles disk.
    h.store.fail_writes.store(false, Ordering::SeqCst);
    engine.update(false).await;
    assert!(engine.status().failed_owners.is_empty());
    assert_eq!(h.store.inner.len("things:items"), 2);
  }

  #[tokio::test]
  async fn test_init_fails_open() {
    let h = Harness::new(vec![Owner::character(1, "One")]);
    h.store.fail_reads.store(true, Ordering::SeqCst);
    let engine = h.engine();

    engine.init().await;

    assert!(engine.is_initialized());
    assert!(engine.is_empty());
  }

  #[test]
  fn test_missing_fetcher_is_rejected() {
    let h = Harness::new(Vec::new());
    let config = EngineConfig::<Item>::new("broken").endpoint(endpoint_for);
    let result = VisibilityEngine::new(config, h.store.clone(), h.expiry.clone(), h.directory.clone());
    assert!(result.is_err());

    let config = EngineConfig::<Item>::new("broken").fetcher(|_, _| async {
      Ok(FetchOutcome::NotModified {
        expires_at: Utc::now(),
        etag: None,
      })
    });
    let result = VisibilityEngine::new(config, h.store.clone(), h.expiry.clone(), h.directory.clone());
    assert!(result.is_err());
  }

  // --------------------------------------------------------------------------
  // Lifecycle, hooks and concurrency
  // --------------------------------------------------------------------------

  #[tokio::test]
  async fn test_init_is_single_flight_and_loads_persisted_state() {
    let (h, _engine) = scenario_a().await;

    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    let engine = h.engine_with(h.config().after_init(move |records: &[Item]| {
      assert_eq!(records.len(), 3);
      counter.fetch_add(1, Ordering::SeqCst);
    }));

    tokio::join!(engine.init(), engine.init(), engine.init());

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(engine.record_ids(), ids(&[100, 101, 102]));
    assert_eq!(engine.visible_ids("character-2"), Some(ids(&[100, 102])));
    assert_eq!(engine.record(100).unwrap().source.kind, OwnerKind::Character);
  }

  #[tokio::test]
  async fn test_update_for_owner_reports_previous_visibility() {
    let (h, _) = scenario_a().await;

    let seen: Arc<Mutex<Vec<(Vec<i64>, BTreeSet<i64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let engine = h.engine_with(h.config().after_owner_update(move |update: &OwnerUpdate<Item>| {
      let newly: Vec<i64> = update.newly_visible().map(|i| i.id).collect();
      sink
        .lock()
        .unwrap()
        .push((newly, update.previous_ids.clone()));
    }));
    engine.init().await;

    h.upstream.reply("character-1", Reply::Records(items(&[100, 103])));
    engine.update_for_owner(&Owner::character(1, "One")).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, vec![103]);
    assert_eq!(seen[0].1, ids(&[100, 101]));

    // 101 was only visible to character 1; 102 is still held by character 2.
    assert_eq!(engine.record_ids(), ids(&[100, 102, 103]));
  }

  #[tokio::test]
  async fn test_batch_hook_receives_changed_owners() {
    let h = Harness::new(three_characters());
    h.upstream.reply("character-1", Reply::Records(items(&[1])));
    h.upstream.reply("character-2", Reply::Fail);
    h.upstream.reply("character-3", Reply::Records(items(&[3])));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let engine = h.engine_with(h.config().after_batch_update(move |updates: &[OwnerUpdate<Item>]| {
      sink
        .lock()
        .unwrap()
        .extend(updates.iter().map(|u| u.owner.key()));
    }));

    engine.update(true).await;

    assert_eq!(
      *seen.lock().unwrap(),
      vec!["character-1".to_string(), "character-3".to_string()]
    );
  }

  #[tokio::test]
  async fn test_update_for_owner_clears_its_failure() {
    let h = Harness::new(vec![Owner::character(1, "One")]);
    h.upstream.reply("character-1", Reply::Fail);
    let engine = h.engine();

    engine.update_for_owner(&Owner::character(1, "One")).await;
    assert_eq!(engine.status().failed_owners, vec!["character-1".to_string()]);
    assert!(engine.status().error.is_some());

    h.upstream.reply("character-1", Reply::Records(items(&[1])));
    engine.update_for_owner(&Owner::character(1, "One")).await;
    assert!(engine.status().failed_owners.is_empty());
    assert!(engine.status().error.is_none());
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_of_one_owner_are_serialized() {
    let h = Harness::new(vec![Owner::character(1, "One")]);
    h.upstream.reply("character-1", Reply::Records(items(&[1])));
    h.upstream.delay_ms.store(30, Ordering::SeqCst);
    let engine = h.engine();
    let owner = Owner::character(1, "One");

    tokio::join!(
      engine.update_for_owner(&owner),
      engine.update_for_owner(&owner),
      engine.update(true),
    );

    assert_eq!(h.upstream.calls().len(), 1);
    assert!(!engine.is_updating());
  }

  #[tokio::test]
  async fn test_overlapping_batches_run_once() {
    let h = Harness::new(three_characters());
    h.upstream.delay_ms.store(10, Ordering::SeqCst);
    let engine = h.engine();

    let mut status = engine.subscribe();
    tokio::join!(engine.update(true), engine.update(true));

    assert_eq!(h.upstream.calls().len(), 3);
    assert!(status.has_changed().unwrap());
    assert!(!status.borrow_and_update().is_updating);
  }

  #[tokio::test]
  async fn test_owner_kind_and_scope_filter_candidates() {
    let h = Harness::new(vec![
      Owner::character(1, "One").with_scopes(["read_things"]),
      Owner::character(2, "Two"),
      Owner::corporation(98, 1, "Corp").with_scopes(["read_things"]),
    ]);
    let engine = h.engine_with(
      h.config()
        .owner_kind(OwnerKind::Character)
        .required_scope(|_| Some("read_things")),
    );

    engine.update(true).await;
    engine
      .update_for_owner(&Owner::corporation(98, 1, "Corp").with_scopes(["read_things"]))
      .await;

    let calls: Vec<String> = h.upstream.calls().into_iter().map(|(k, _)| k).collect();
    assert_eq!(calls, vec!["character-1"]);
  }

  #[tokio::test]
  async fn test_per_kind_scope_shares_records_across_kinds() {
    let h = Harness::new(vec![
      Owner::character(1, "One").with_scopes(["read_own"]),
      Owner::corporation(98, 1, "Corp").with_scopes(["read_corp"]),
      Owner::corporation(99, 1, "Other").with_scopes(["read_own"]),
    ]);
    h.upstream.reply("character-1", Reply::Records(items(&[100, 101])));
    h.upstream.reply("corporation-98", Reply::Records(items(&[100])));
    let engine = h.engine_with(h.config().required_scope(|kind| match kind {
      OwnerKind::Character => Some("read_own"),
      OwnerKind::Corporation => Some("read_corp"),
    }));

    engine.update(true).await;

    let calls: Vec<String> = h.upstream.calls().into_iter().map(|(k, _)| k).collect();
    assert_eq!(calls, vec!["character-1", "corporation-98"]);
    assert_eq!(engine.len(), 2);
    assert_eq!(engine.visible_ids("corporation-98"), Some(ids(&[100])));

    // The shared record outlives the character that also saw it.
    engine.remove_for_owner(OwnerKind::Character, 1).await;
    assert_eq!(engine.record_ids(), ids(&[100]));
    assert_eq!(engine.record(100).unwrap().source.kind, OwnerKind::Corporation);
  }

  #[tokio::test]
  async fn test_refresh_callback_reaches_engine() {
    let (h, engine) = scenario_a().await;
    let _subscription = engine.register_refresh("/things/");

    h.upstream.reply("character-2", Reply::Records(items(&[104])));
    let ran = h.expiry.trigger_refresh("character-2", None).await;

    assert_eq!(ran, 1);
    assert_eq!(engine.visible_ids("character-2"), Some(ids(&[104])));
    assert_eq!(engine.record_ids(), ids(&[100, 101, 104]));
  }

  #[tokio::test]
  async fn test_remove_unknown_owner_is_noop() {
    let (_h, engine) = scenario_a().await;
    assert_eq!(
      engine.remove_for_owner(OwnerKind::Corporation, 1).await,
      Outcome::default()
    );
    assert_eq!(engine.len(), 3);
  }

  #[tokio::test]
  async fn test_outcome_reports_only_this_call() {
    let (h, engine) = scenario_a().await;

    h.fail_writes(true);
    let failed = engine.remove_for_owner(OwnerKind::Character, 1).await;
    assert_eq!(
      failed.error.as_deref(),
      Some("Failed to remove things for character-1")
    );
    h.fail_writes(false);

    // The earlier failure stays in the status but not in later outcomes.
    assert_eq!(
      engine.remove_for_owner(OwnerKind::Character, 9).await,
      Outcome::default()
    );
    let removed = engine.remove_for_owner(OwnerKind::Character, 2).await;
    assert!(removed.changed);
    assert!(removed.error.is_none());
    assert!(engine.status().error.is_some());
  }

  #[tokio::test]
  async fn test_update_with_nothing_due_reports_no_error() {
    let h = Harness::new(vec![Owner::character(1, "One")]);
    h.upstream.reply("character-1", Reply::Unauthorized);
    let engine = h.engine();

    let first = engine.update(false).await;
    assert_eq!(first.error.as_deref(), Some("Failed to fetch any things"));

    // The rejected owner is no longer a candidate.
    let second = engine.update(false).await;
    assert_eq!(second, Outcome::default());
    assert_eq!(h.upstream.calls().len(), 1);
  }
}
