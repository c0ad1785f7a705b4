//! Construction parameters for a visibility engine.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use super::{Entity, FetchOutcome};
use crate::owner::{Owner, OwnerKind};

pub(crate) type FetchFn<T> =
  Arc<dyn Fn(Owner, Option<String>) -> BoxFuture<'static, Result<FetchOutcome<T>>> + Send + Sync>;
pub(crate) type EndpointFn = Arc<dyn Fn(&Owner) -> String + Send + Sync>;
pub(crate) type ScopeFn = Arc<dyn Fn(OwnerKind) -> Option<&'static str> + Send + Sync>;
pub(crate) type EmptyFn<T> = Arc<dyn Fn(&[T]) -> bool + Send + Sync>;
pub(crate) type InitHook<T> = Arc<dyn Fn(&[T]) + Send + Sync>;
pub(crate) type OwnerHook<T> = Arc<dyn Fn(&OwnerUpdate<T>) + Send + Sync>;
pub(crate) type BatchHook<T> = Arc<dyn Fn(&[OwnerUpdate<T>]) + Send + Sync>;

/// Result of a successful fetch for one owner, handed to the update hooks.
#[derive(Debug, Clone)]
pub struct OwnerUpdate<T> {
  pub owner: Owner,
  /// Everything the owner can see now.
  pub records: Vec<T>,
  /// The owner's visibility set before this fetch.
  pub previous_ids: BTreeSet<i64>,
}

impl<T: Entity> OwnerUpdate<T> {
  /// Records the owner could not see before this fetch.
  pub fn newly_visible(&self) -> impl Iterator<Item = &T> {
    self
      .records
      .iter()
      .filter(|r| !self.previous_ids.contains(&r.record_id()))
  }
}

/// Builder for the parameters of one engine instance.
///
/// `endpoint` and `fetcher` are required; everything else has defaults:
/// existing records are overwritten on re-fetch and stale records are
/// garbage-collected.
pub struct EngineConfig<T> {
  pub(crate) name: String,
  pub(crate) endpoint: Option<EndpointFn>,
  pub(crate) fetcher: Option<FetchFn<T>>,
  pub(crate) is_empty: EmptyFn<T>,
  pub(crate) owner_kind: Option<OwnerKind>,
  pub(crate) required_scope: Option<ScopeFn>,
  pub(crate) should_update_existing: bool,
  pub(crate) should_delete_stale_items: bool,
  pub(crate) after_init: Option<InitHook<T>>,
  pub(crate) after_owner_update: Option<OwnerHook<T>>,
  pub(crate) after_batch_update: Option<BatchHook<T>>,
}

impl<T: Entity> EngineConfig<T> {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      endpoint: None,
      fetcher: None,
      is_empty: Arc::new(|records: &[T]| records.is_empty()),
      owner_kind: None,
      required_scope: None,
      should_update_existing: true,
      should_delete_stale_items: true,
      after_init: None,
      after_owner_update: None,
      after_batch_update: None,
    }
  }

  /// Source endpoint for an owner. Also the expiry key.
  pub fn endpoint<F>(mut self, endpoint: F) -> Self
  where
    F: Fn(&Owner) -> String + Send + Sync + 'static,
  {
    self.endpoint = Some(Arc::new(endpoint));
    self
  }

  /// Fetch function. Receives the owner and the stored ETag, if any.
  pub fn fetcher<F, Fut>(mut self, fetcher: F) -> Self
  where
    F: Fn(Owner, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FetchOutcome<T>>> + Send + 'static,
  {
    self.fetcher = Some(Arc::new(move |owner, etag| Box::pin(fetcher(owner, etag))));
    self
  }

  /// Only fetch for owners of this kind.
  pub fn owner_kind(mut self, kind: OwnerKind) -> Self {
    self.owner_kind = Some(kind);
    self
  }

  /// Scope an owner must hold, by owner kind. Kinds mapped to `None` are
  /// not served at all.
  pub fn required_scope<F>(mut self, scope: F) -> Self
  where
    F: Fn(OwnerKind) -> Option<&'static str> + Send + Sync + 'static,
  {
    self.required_scope = Some(Arc::new(scope));
    self
  }

  /// Runs after `init` when persisted records were loaded.
  pub fn after_init<F>(mut self, hook: F) -> Self
  where
    F: Fn(&[T]) + Send + Sync + 'static,
  {
    self.after_init = Some(Arc::new(hook));
    self
  }

  /// Runs after a successful `update_for_owner`.
  pub fn after_owner_update<F>(mut self, hook: F) -> Self
  where
    F: Fn(&OwnerUpdate<T>) + Send + Sync + 'static,
  {
    self.after_owner_update = Some(Arc::new(hook));
    self
  }

  /// Runs after a batch `update` in which at least one owner changed.
  pub fn after_batch_update<F>(mut self, hook: F) -> Self
  where
    F: Fn(&[OwnerUpdate<T>]) + Send + Sync + 'static,
  {
    self.after_batch_update = Some(Arc::new(hook));
    self
  }

  /// Check required parameters.
  pub(crate) fn validate(&self) -> Result<()> {
    if self.name.trim().is_empty() {
      return Err(eyre!("Engine name must not be empty"));
    }
    if self.endpoint.is_none() {
      return Err(eyre!("Engine '{}' has no endpoint", self.name));
    }
    if self.fetcher.is_none() {
      return Err(eyre!("Engine '{}' has no fetcher", self.name));
    }
    Ok(())
  }

  /// Whether an owner is in scope for this engine at all.
  pub(crate) fn applies_to(&self, owner: &Owner) -> bool {
    self.owner_kind.map_or(true, |k| k == owner.kind)
      && self
        .required_scope
        .as_ref()
        .map_or(true, |scope| scope(owner.kind).map_or(false, |s| owner.has_scope(s)))
  }
}

/// Switches only exercised by tests; every production engine keeps the
/// defaults.
#[cfg(test)]
impl<T: Entity> EngineConfig<T> {
  /// Predicate deciding whether an owner's result counts as empty.
  pub fn is_empty<F>(mut self, is_empty: F) -> Self
  where
    F: Fn(&[T]) -> bool + Send + Sync + 'static,
  {
    self.is_empty = Arc::new(is_empty);
    self
  }

  /// Overwrite an existing record's payload on re-fetch (default), or keep
  /// the first one seen.
  pub fn update_existing(mut self, enabled: bool) -> Self {
    self.should_update_existing = enabled;
    self
  }

  /// Enable the garbage-collection pass (default). Disable it when another
  /// subsystem also deletes this engine's records.
  pub fn delete_stale_items(mut self, enabled: bool) -> Self {
    self.should_delete_stale_items = enabled;
    self
  }
}
