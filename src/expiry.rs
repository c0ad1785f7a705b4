//! Expiry and ETag bookkeeping per (owner, endpoint).
//!
//! The registry answers one question: is this owner's copy of this endpoint
//! stale? It also holds the refresh callbacks that let a scheduler ask
//! "refresh this owner's data now" without knowing which engine owns which
//! endpoint. Callbacks are matched by substring against the endpoints that
//! have been recorded for the owner.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info};

use crate::store::KeyValueStore;

const COLLECTION: &str = "expiry";

/// Cache validity for one owner at one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryRecord {
  pub owner_key: String,
  pub endpoint: String,
  pub expires_at: DateTime<Utc>,
  pub etag: Option<String>,
  /// Whether the last definitive answer carried no data.
  pub is_empty: bool,
}

impl ExpiryRecord {
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

type RecordKey = (String, String);
type RefreshFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

struct Callback {
  id: u64,
  pattern: String,
  refresh: RefreshFn,
}

type Callbacks = Mutex<Vec<Callback>>;

/// Handle returned by [`ExpiryRegistry::register_refresh_callback`].
pub struct RefreshSubscription {
  id: u64,
  callbacks: Weak<Callbacks>,
}

impl RefreshSubscription {
  /// Remove the callback. Later triggers no longer reach it.
  pub fn unsubscribe(self) {
    if let Some(callbacks) = self.callbacks.upgrade() {
      if let Ok(mut callbacks) = callbacks.lock() {
        callbacks.retain(|c| c.id != self.id);
      }
    }
  }
}

/// Process-wide expiry table, shared by reference with every engine.
pub struct ExpiryRegistry<S> {
  store: Arc<S>,
  records: Mutex<BTreeMap<RecordKey, ExpiryRecord>>,
  callbacks: Arc<Callbacks>,
  next_id: AtomicU64,
}

fn storage_key(owner_key: &str, endpoint: &str) -> String {
  format!("{}|{}", owner_key, endpoint)
}

impl<S: KeyValueStore> ExpiryRegistry<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      records: Mutex::new(BTreeMap::new()),
      callbacks: Arc::new(Mutex::new(Vec::new())),
      next_id: AtomicU64::new(1),
    }
  }

  fn records(&self) -> MutexGuard<'_, BTreeMap<RecordKey, ExpiryRecord>> {
    // Every critical section is a plain map update, so a poisoned lock still
    // holds consistent data.
    self.records.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Load persisted records. Fails open: on a storage error the registry
  /// starts empty and everything is treated as expired.
  pub fn load(&self) -> usize {
    match self.store.get_all::<ExpiryRecord>(COLLECTION) {
      Ok(entries) => {
        let mut records = self.records();
        records.clear();
        for (_, record) in entries {
          records.insert(
            (record.owner_key.clone(), record.endpoint.clone()),
            record,
          );
        }
        info!(count = records.len(), "Loaded expiry records");
        records.len()
      }
      Err(e) => {
        error!(error = %e, "Failed to load expiry records, starting empty");
        0
      }
    }
  }

  /// True if nothing is recorded for the pair, or its expiry has passed.
  pub fn is_expired(&self, owner_key: &str, endpoint: &str) -> bool {
    self.is_expired_at(owner_key, endpoint, Utc::now())
  }

  pub fn is_expired_at(&self, owner_key: &str, endpoint: &str, now: DateTime<Utc>) -> bool {
    self
      .records()
      .get(&(owner_key.to_string(), endpoint.to_string()))
      .map_or(true, |r| r.is_expired_at(now))
  }

  pub fn get(&self, owner_key: &str, endpoint: &str) -> Option<ExpiryRecord> {
    self
      .records()
      .get(&(owner_key.to_string(), endpoint.to_string()))
      .cloned()
  }

  /// Upsert the record after a fetch that produced a definitive answer.
  ///
  /// Memory is updated before the write, so a storage failure leaves the
  /// in-process decision correct until restart.
  pub fn set_expiry(
    &self,
    owner_key: &str,
    endpoint: &str,
    expires_at: DateTime<Utc>,
    etag: Option<String>,
    is_empty: bool,
  ) -> Result<()> {
    let record = ExpiryRecord {
      owner_key: owner_key.to_string(),
      endpoint: endpoint.to_string(),
      expires_at,
      etag,
      is_empty,
    };

    self.records().insert(
      (owner_key.to_string(), endpoint.to_string()),
      record.clone(),
    );

    self
      .store
      .put(COLLECTION, &storage_key(owner_key, endpoint), &record)
      .map_err(|e| eyre!("Failed to persist expiry for {} {}: {}", owner_key, endpoint, e))
  }

  /// Endpoints recorded for an owner.
  pub fn endpoints_for(&self, owner_key: &str) -> Vec<String> {
    self
      .records()
      .keys()
      .filter(|(k, _)| k == owner_key)
      .map(|(_, e)| e.clone())
      .collect()
  }

  /// Remove every record of an owner, across all endpoints.
  pub fn clear_for_owner(&self, owner_key: &str) -> Result<()> {
    let keys: Vec<String> = {
      let mut records = self.records();
      let removed: Vec<RecordKey> = records
        .keys()
        .filter(|(k, _)| k == owner_key)
        .cloned()
        .collect();
      for key in &removed {
        records.remove(key);
      }
      removed
        .iter()
        .map(|(k, e)| storage_key(k, e))
        .collect()
    };

    debug!(owner = %owner_key, count = keys.len(), "Clearing expiry records");
    self.store.delete_batch(COLLECTION, &keys)
  }

  /// Remove the record for one owner and endpoint.
  pub fn clear_endpoint(&self, owner_key: &str, endpoint: &str) -> Result<()> {
    self
      .records()
      .remove(&(owner_key.to_string(), endpoint.to_string()));
    self
      .store
      .delete(COLLECTION, &storage_key(owner_key, endpoint))
  }

  /// Drop everything, in memory and on disk.
  pub fn clear(&self) -> Result<()> {
    self.records().clear();
    self.store.clear(COLLECTION)
  }

  /// Register a refresh callback for endpoints containing `pattern`.
  pub fn register_refresh_callback<F, Fut>(
    &self,
    pattern: impl Into<String>,
    callback: F,
  ) -> RefreshSubscription
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let callback = Callback {
      id,
      pattern: pattern.into(),
      refresh: Arc::new(move |key| Box::pin(callback(key))),
    };

    self
      .callbacks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(callback);

    RefreshSubscription {
      id,
      callbacks: Arc::downgrade(&self.callbacks),
    }
  }

  /// Callbacks whose pattern matches any of `endpoints`, each at most once.
  fn matching_callbacks(&self, endpoints: &[String]) -> Vec<RefreshFn> {
    let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
    callbacks
      .iter()
      .filter(|c| endpoints.iter().any(|e| e.contains(&c.pattern)))
      .map(|c| Arc::clone(&c.refresh))
      .collect()
  }

  /// Ask for an immediate refresh of an owner's data.
  ///
  /// `filter` narrows the owner's recorded endpoints before callbacks are
  /// matched against them. Returns the number of callbacks that ran.
  pub async fn trigger_refresh(&self, owner_key: &str, filter: Option<&str>) -> usize {
    let endpoints: Vec<String> = self
      .endpoints_for(owner_key)
      .into_iter()
      .filter(|e| filter.map_or(true, |f| e.contains(f)))
      .collect();

    let callbacks = self.matching_callbacks(&endpoints);
    let count = callbacks.len();
    for refresh in callbacks {
      refresh(owner_key.to_string()).await;
    }
    count
  }

  /// Periodic sweep: refresh every owner that has an expired endpoint.
  pub async fn refresh_expired(&self) -> usize {
    let now = Utc::now();
    let expired: BTreeMap<String, Vec<String>> = {
      let records = self.records();
      let mut expired: BTreeMap<String, Vec<String>> = BTreeMap::new();
      for record in records.values().filter(|r| r.is_expired_at(now)) {
        expired
          .entry(record.owner_key.clone())
          .or_default()
          .push(record.endpoint.clone());
      }
      expired
    };

    let mut ran = 0;
    for (owner_key, endpoints) in expired {
      let callbacks = self.matching_callbacks(&endpoints);
      debug!(owner = %owner_key, endpoints = endpoints.len(), callbacks = callbacks.len(), "Refreshing expired owner");
      for refresh in callbacks {
        refresh(owner_key.clone()).await;
        ran += 1;
      }
    }
    ran
  }
}
