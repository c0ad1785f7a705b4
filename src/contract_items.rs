//! Contract line items, fetched lazily after the contracts themselves.
//!
//! Items are keyed by contract id and fetched at most once per contract
//! through a [`SecondaryQueue`]. They carry no visibility of their own: they
//! live as long as some contract engine still holds their contract.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::engine::SecondaryQueue;
use crate::esi::types::ContractItem;
use crate::owner::{Owner, OwnerDirectory, OwnerKind, SourceOwner};
use crate::registry::OwnerAwareStore;
use crate::store::KeyValueStore;

pub const COLLECTION: &str = "contract_items";

type ItemsFetchFn =
  Arc<dyn Fn(Owner, i64) -> BoxFuture<'static, Result<Vec<ContractItem>>> + Send + Sync>;

pub struct ContractItemsStore<S> {
  store: Arc<S>,
  directory: Arc<dyn OwnerDirectory>,
  fetch: ItemsFetchFn,
  items: Mutex<BTreeMap<i64, Vec<ContractItem>>>,
  queue: SecondaryQueue,
  initialized: AtomicBool,
  /// Bumped by `clear`; fetches queued before it are discarded.
  generation: AtomicU64,
}

impl<S: KeyValueStore + 'static> ContractItemsStore<S> {
  /// Must be called inside a tokio runtime; the fetch queue spawns a worker.
  pub fn new<F, Fut>(
    store: Arc<S>,
    directory: Arc<dyn OwnerDirectory>,
    concurrency: usize,
    fetch: F,
  ) -> Arc<Self>
  where
    F: Fn(Owner, i64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<ContractItem>>> + Send + 'static,
  {
    Arc::new(Self {
      store,
      directory,
      fetch: Arc::new(move |owner, id| Box::pin(fetch(owner, id))),
      items: Mutex::new(BTreeMap::new()),
      queue: SecondaryQueue::spawn(COLLECTION, concurrency),
      initialized: AtomicBool::new(false),
      generation: AtomicU64::new(0),
    })
  }

  fn items(&self) -> MutexGuard<'_, BTreeMap<i64, Vec<ContractItem>>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Load persisted items. Fails open like the engines do.
  pub fn init(&self) {
    if self.initialized.load(Ordering::SeqCst) {
      return;
    }

    match self.store.get_all::<Vec<ContractItem>>(COLLECTION) {
      Ok(entries) => {
        let mut items = self.items();
        for (key, value) in entries {
          match key.parse::<i64>() {
            Ok(id) => {
              items.insert(id, value);
            }
            Err(_) => warn!(key = %key, "Ignoring contract items with a non-numeric key"),
          }
        }
        info!(contracts = items.len(), "Contract items loaded");
      }
      Err(e) => error!(error = %e, "Failed to load contract items, starting empty"),
    }
    self.initialized.store(true, Ordering::SeqCst);
  }

  pub fn has(&self, contract_id: i64) -> bool {
    self.items().contains_key(&contract_id)
  }

  pub fn len(&self) -> usize {
    self.items().len()
  }

  /// Store fetched items unless the store was cleared after the fetch was
  /// queued. Returns whether they were kept.
  fn put_fetched(&self, contract_id: i64, items: Vec<ContractItem>, generation: u64) -> Result<bool> {
    let mut held = self.items();
    if self.generation.load(Ordering::SeqCst) != generation {
      return Ok(false);
    }
    self
      .store
      .put(COLLECTION, &contract_id.to_string(), &items)
      .map_err(|e| eyre!("Failed to store items for contract {}: {}", contract_id, e))?;
    held.insert(contract_id, items);
    Ok(true)
  }

  /// Drop items whose contract is no longer held. Returns how many went.
  pub fn retain(&self, live: &BTreeSet<i64>) -> Result<usize> {
    let dead: Vec<String> = {
      let mut items = self.items();
      let dead: Vec<i64> = items
        .keys()
        .filter(|id| !live.contains(id))
        .copied()
        .collect();
      for id in &dead {
        items.remove(id);
      }
      dead.iter().map(i64::to_string).collect()
    };

    if !dead.is_empty() {
      self
        .store
        .delete_batch(COLLECTION, &dead)
        .map_err(|e| eyre!("Failed to prune contract items: {}", e))?;
      debug!(removed = dead.len(), "Pruned contract items");
    }
    Ok(dead.len())
  }

  pub fn clear(&self) -> Result<()> {
    let mut items = self.items();
    self.generation.fetch_add(1, Ordering::SeqCst);
    items.clear();
    self.initialized.store(false, Ordering::SeqCst);
    self
      .store
      .clear(COLLECTION)
      .map_err(|e| eyre!("Failed to clear contract items: {}", e))
  }

  /// Queue an items fetch using the credentials of `source`.
  ///
  /// Returns `false` when the items are already stored or queued, or the
  /// source owner can no longer authenticate.
  pub fn schedule(self: &Arc<Self>, contract_id: i64, source: SourceOwner) -> bool {
    if self.has(contract_id) || self.queue.is_pending(contract_id) {
      return false;
    }

    let owner = match self.directory.find(&source.key()) {
      Some(owner) if !owner.auth_failed => owner,
      _ => {
        debug!(contract_id, owner = %source.key(), "No usable credentials for contract items");
        return false;
      }
    };

    let this = self.clone();
    let generation = self.generation.load(Ordering::SeqCst);
    self.queue.enqueue(contract_id, async move {
      let key = owner.key();
      match (this.fetch)(owner, contract_id).await {
        Ok(items) => match this.put_fetched(contract_id, items, generation) {
          Ok(true) => {}
          Ok(false) => debug!(contract_id, "Dropping contract items fetched before a clear"),
          Err(e) => error!(contract_id, error = %e, "Failed to persist contract items"),
        },
        Err(e) => warn!(contract_id, owner = %key, error = %e, "Failed to fetch contract items"),
      }
    })
  }

  /// Wait for queued fetches to finish.
  pub async fn idle(&self) {
    self.queue.idle().await
  }
}

#[async_trait]
impl<S: KeyValueStore + 'static> OwnerAwareStore for ContractItemsStore<S> {
  fn name(&self) -> &str {
    COLLECTION
  }

  async fn init(&self) -> Result<()> {
    ContractItemsStore::init(self);
    Ok(())
  }

  /// Items follow their contracts; an update only drains the fetch queue.
  async fn update(&self, _force: bool) -> Result<()> {
    self.idle().await;
    Ok(())
  }

  /// Items of contracts the owner alone could see are pruned together with
  /// those contracts.
  async fn remove_for_owner(&self, _kind: OwnerKind, _id: i64) -> Result<()> {
    Ok(())
  }

  async fn clear(&self) -> Result<()> {
    ContractItemsStore::clear(self)
  }

  fn is_updating(&self) -> bool {
    self.queue.pending_len() > 0
  }

  fn record_count(&self) -> usize {
    self.len()
  }
}
