//! Test doubles for engines: a failable store, a directory and a scripted upstream.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{EngineConfig, Entity, FetchOutcome, VisibilityEngine};
use crate::esi::EsiError;
use crate::expiry::ExpiryRegistry;
use crate::owner::{Owner, OwnerDirectory};
use crate::store::{KeyValueStore, MemoryStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
  pub id: i64,
  pub label: String,
}

impl Entity for Item {
  fn record_id(&self) -> i64 {
    self.id
  }
}

pub fn item(id: i64) -> Item {
  Item {
    id,
    label: format!("item {}", id),
  }
}

pub fn items(ids: &[i64]) -> Vec<Item> {
  ids.iter().copied().map(item).collect()
}

pub fn ids(ids: &[i64]) -> BTreeSet<i64> {
  ids.iter().copied().collect()
}

/// Memory store whose reads or writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
  pub inner: MemoryStore,
  pub fail_reads: AtomicBool,
  pub fail_writes: AtomicBool,
}

impl FlakyStore {
  fn check_write(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("disk full"));
    }
    Ok(())
  }
}

impl KeyValueStore for FlakyStore {
  fn get_all<V: DeserializeOwned>(&self, collection: &str) -> Result<Vec<(String, V)>> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(eyre!("corrupt database"));
    }
    self.inner.get_all(collection)
  }

  fn put<V: Serialize>(&self, collection: &str, key: &str, value: &V) -> Result<()> {
    self.check_write()?;
    self.inner.put(collection, key, value)
  }

  fn put_batch<V: Serialize>(&self, collection: &str, entries: &[(String, V)]) -> Result<()> {
    self.check_write()?;
    self.inner.put_batch(collection, entries)
  }

  fn delete(&self, collection: &str, key: &str) -> Result<()> {
    self.check_write()?;
    self.inner.delete(collection, key)
  }

  fn delete_batch(&self, collection: &str, keys: &[String]) -> Result<()> {
    self.check_write()?;
    self.inner.delete_batch(collection, keys)
  }

  fn clear(&self, collection: &str) -> Result<()> {
    self.check_write()?;
    self.inner.clear(collection)
  }
}

#[derive(Default)]
pub struct TestDirectory {
  pub owners: Mutex<Vec<Owner>>,
  pub failed: Mutex<HashSet<String>>,
}

impl OwnerDirectory for TestDirectory {
  fn list_owners(&self) -> Vec<Owner> {
    let failed = self.failed.lock().unwrap();
    self
      .owners
      .lock()
      .unwrap()
      .iter()
      .cloned()
      .map(|mut o| {
        o.auth_failed = failed.contains(&o.key());
        o
      })
      .collect()
  }

  fn access_token(&self, _owner: &Owner) -> Result<String> {
    Ok("token".to_string())
  }

  fn mark_auth_failed(&self, owner_key: &str) {
    self.failed.lock().unwrap().insert(owner_key.to_string());
  }
}

#[derive(Clone)]
pub enum Reply {
  Records(Vec<Item>),
  NotModified,
  Fail,
  NotMember,
  Unauthorized,
}

/// Scripted upstream: one reply per owner key, every call recorded.
#[derive(Default)]
pub struct Upstream {
  replies: Mutex<HashMap<String, Reply>>,
  calls: Mutex<Vec<(String, Option<String>)>>,
  pub delay_ms: AtomicUsize,
}

impl Upstream {
  pub fn reply(&self, owner_key: &str, reply: Reply) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(owner_key.to_string(), reply);
  }

  pub fn calls(&self) -> Vec<(String, Option<String>)> {
    self.calls.lock().unwrap().clone()
  }

  async fn fetch(&self, owner: Owner, etag: Option<String>) -> Result<FetchOutcome<Item>> {
    let key = owner.key();
    self.calls.lock().unwrap().push((key.clone(), etag));

    let delay = self.delay_ms.load(Ordering::SeqCst) as u64;
    if delay > 0 {
      tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }

    let reply = self
      .replies
      .lock()
      .unwrap()
      .get(&key)
      .cloned()
      .unwrap_or(Reply::Records(Vec::new()));
    let expires_at = Utc::now() + Duration::minutes(5);
    let endpoint = format!("/things/{}", key);

    match reply {
      Reply::Records(records) => Ok(FetchOutcome::Modified {
        records,
        expires_at,
        etag: Some(format!("\"etag-{}\"", key)),
      }),
      Reply::NotModified => Ok(FetchOutcome::NotModified {
        expires_at,
        etag: Some(format!("\"etag-{}\"", key)),
      }),
      Reply::Fail => Err(eyre!("upstream returned 502")),
      Reply::NotMember => Err(EsiError::NotInCorporation { endpoint }.into()),
      Reply::Unauthorized => Err(
        EsiError::Unauthorized {
          endpoint,
          status: 401,
        }
        .into(),
      ),
    }
  }
}

pub type Engine = Arc<VisibilityEngine<Item, FlakyStore>>;

pub fn endpoint_for(owner: &Owner) -> String {
  format!("/{}s/{}/things/", owner.kind, owner.id)
}

/// Shared collaborators for engines under test.
pub struct Harness {
  pub store: Arc<FlakyStore>,
  pub expiry: Arc<ExpiryRegistry<FlakyStore>>,
  pub directory: Arc<TestDirectory>,
  pub upstream: Arc<Upstream>,
}

impl Harness {
  pub fn new(owners: Vec<Owner>) -> Self {
    let store = Arc::new(FlakyStore::default());
    Self {
      expiry: Arc::new(ExpiryRegistry::new(store.clone())),
      store,
      directory: Arc::new(TestDirectory {
        owners: Mutex::new(owners),
        failed: Mutex::new(HashSet::new()),
      }),
      upstream: Arc::new(Upstream::default()),
    }
  }

  pub fn config(&self) -> EngineConfig<Item> {
    let upstream = self.upstream.clone();
    EngineConfig::new("things")
      .endpoint(endpoint_for)
      .fetcher(move |owner, etag| {
        let upstream = upstream.clone();
        async move { upstream.fetch(owner, etag).await }
      })
  }

  pub fn engine_with(&self, config: EngineConfig<Item>) -> Engine {
    VisibilityEngine::new(
      config,
      self.store.clone(),
      self.expiry.clone(),
      self.directory.clone(),
    )
    .unwrap()
  }

  pub fn engine(&self) -> Engine {
    self.engine_with(self.config())
  }

  pub fn fail_writes(&self, fail: bool) {
    self.store.fail_writes.store(fail, Ordering::SeqCst);
  }
}

/// Character 1 sees {100, 101}, character 2 sees {100, 102}.
pub async fn scenario_a() -> (Harness, Engine) {
  let h = Harness::new(vec![Owner::character(1, "One"), Owner::character(2, "Two")]);
  h.upstream
    .reply("character-1", Reply::Records(items(&[100, 101])));
  h.upstream
    .reply("character-2", Reply::Records(items(&[100, 102])));
  let engine = h.engine();
  engine.update(true).await;
  (h, engine)
}
