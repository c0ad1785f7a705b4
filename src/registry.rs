//! Directory of owner-aware stores with fan-out lifecycle operations.
//!
//! Engines do not register themselves. Bootstrap code builds every store,
//! then calls [`StoreRegistry::register`] for each one.

use async_trait::async_trait;
use color_eyre::Result;
use futures::future::join_all;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info};

use crate::engine::{Entity, VisibilityEngine};
use crate::owner::OwnerKind;
use crate::store::KeyValueStore;

/// Anything holding per-owner data that must follow owner lifecycle events.
#[async_trait]
pub trait OwnerAwareStore: Send + Sync {
  fn name(&self) -> &str;

  async fn init(&self) -> Result<()>;

  async fn update(&self, force: bool) -> Result<()>;

  async fn remove_for_owner(&self, kind: OwnerKind, id: i64) -> Result<()>;

  async fn clear(&self) -> Result<()>;

  fn is_updating(&self) -> bool;

  fn record_count(&self) -> usize;

  /// Failed owner keys from the last operation, if the store tracks them.
  fn failed_owners(&self) -> Vec<String> {
    Vec::new()
  }
}

#[async_trait]
impl<T, S> OwnerAwareStore for VisibilityEngine<T, S>
where
  T: Entity,
  S: KeyValueStore + 'static,
{
  fn name(&self) -> &str {
    VisibilityEngine::name(self)
  }

  async fn init(&self) -> Result<()> {
    VisibilityEngine::init(self).await;
    Ok(())
  }

  async fn update(&self, force: bool) -> Result<()> {
    VisibilityEngine::update(self, force).await.into_result()
  }

  async fn remove_for_owner(&self, kind: OwnerKind, id: i64) -> Result<()> {
    VisibilityEngine::remove_for_owner(self, kind, id)
      .await
      .into_result()
  }

  async fn clear(&self) -> Result<()> {
    VisibilityEngine::clear(self).await.into_result()
  }

  fn is_updating(&self) -> bool {
    VisibilityEngine::is_updating(self)
  }

  fn record_count(&self) -> usize {
    self.len()
  }

  fn failed_owners(&self) -> Vec<String> {
    self.status().failed_owners
  }
}

/// Flat list of registered stores. Names are unique.
#[derive(Default)]
pub struct StoreRegistry {
  stores: RwLock<Vec<Arc<dyn OwnerAwareStore>>>,
}

impl StoreRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of the registered stores, so no lock is held across awaits.
  fn stores(&self) -> Vec<Arc<dyn OwnerAwareStore>> {
    self
      .stores
      .read()
      .map(|s| s.clone())
      .unwrap_or_else(|e| e.into_inner().clone())
  }

  fn select(&self, names: &[String]) -> Vec<Arc<dyn OwnerAwareStore>> {
    let stores = self.stores();
    for name in names {
      if !stores.iter().any(|s| s.name() == name) {
        debug!(store = %name, "No store registered under this name");
      }
    }
    stores
      .into_iter()
      .filter(|s| names.iter().any(|n| n == s.name()))
      .collect()
  }

  /// Add a store. A store registered under the same name is replaced.
  pub fn register(&self, store: Arc<dyn OwnerAwareStore>) {
    let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
    match stores.iter().position(|s| s.name() == store.name()) {
      Some(index) => {
        debug!(store = %store.name(), "Replacing registered store");
        stores[index] = store;
      }
      None => stores.push(store),
    }
  }

  /// Remove a store by name. Returns `false` if nothing was registered.
  #[allow(dead_code)]
  pub fn unregister(&self, name: &str) -> bool {
    let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
    let before = stores.len();
    stores.retain(|s| s.name() != name);
    stores.len() != before
  }

  pub fn names(&self) -> Vec<String> {
    self.stores().iter().map(|s| s.name().to_string()).collect()
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn OwnerAwareStore>> {
    self.stores().into_iter().find(|s| s.name() == name)
  }

  /// True while any registered store is fetching.
  pub fn is_any_updating(&self) -> bool {
    self.stores().iter().any(|s| s.is_updating())
  }

  /// Drop an owner's data from every store. Returns the stores that failed.
  pub async fn remove_for_owner_all(&self, kind: OwnerKind, id: i64) -> Vec<String> {
    let mut failed = Vec::new();
    for store in self.stores() {
      if let Err(e) = store.remove_for_owner(kind, id).await {
        error!(store = %store.name(), owner_kind = %kind, owner_id = id, error = %e, "Failed to remove owner data");
        failed.push(store.name().to_string());
      }
    }
    info!(owner_kind = %kind, owner_id = id, failed = failed.len(), "Removed owner from all stores");
    failed
  }

  /// Clear every store. Returns the stores that failed.
  pub async fn clear_all(&self) -> Vec<String> {
    Self::clear_each(self.stores()).await
  }

  /// Clear the named stores. Unknown names are ignored.
  pub async fn clear_by_names(&self, names: &[String]) -> Vec<String> {
    Self::clear_each(self.select(names)).await
  }

  async fn clear_each(stores: Vec<Arc<dyn OwnerAwareStore>>) -> Vec<String> {
    let mut failed = Vec::new();
    for store in stores {
      if let Err(e) = store.clear().await {
        error!(store = %store.name(), error = %e, "Failed to clear store");
        failed.push(store.name().to_string());
      }
    }
    failed
  }

  /// Initialize every store not named in `exclude`, concurrently.
  pub async fn init_all(&self, exclude: &[String]) -> Vec<String> {
    let stores: Vec<_> = self
      .stores()
      .into_iter()
      .filter(|s| !exclude.iter().any(|n| n == s.name()))
      .collect();

    let results = join_all(stores.iter().map(|s| s.init())).await;

    stores
      .iter()
      .zip(results)
      .filter_map(|(store, result)| match result {
        Ok(()) => None,
        Err(e) => {
          error!(store = %store.name(), error = %e, "Failed to initialize store");
          Some(store.name().to_string())
        }
      })
      .collect()
  }

  /// Update every store in registration order.
  pub async fn update_all(&self, force: bool) -> Vec<String> {
    let mut failed = Vec::new();
    for store in self.stores() {
      if let Err(e) = store.update(force).await {
        error!(store = %store.name(), error = %e, "Update failed");
        failed.push(store.name().to_string());
      }
    }
    failed
  }

  /// Initialize, then force-update the named stores one after another.
  pub async fn refetch_by_names(&self, names: &[String]) -> Vec<String> {
    let mut failed = Vec::new();
    for store in self.select(names) {
      let result = match store.init().await {
        Ok(()) => store.update(true).await,
        Err(e) => Err(e),
      };
      if let Err(e) = result {
        error!(store = %store.name(), error = %e, "Refetch failed");
        failed.push(store.name().to_string());
      }
    }
    failed
  }
}
