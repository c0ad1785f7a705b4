//! Every mirrored entity kind, wired to ESI and registered explicitly.
//!
//! Each kind has a single engine serving characters and corporations alike,
//! so a record visible to several owners of either kind is stored once.

use color_eyre::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::SyncConfig;
use crate::contract_items::ContractItemsStore;
use crate::engine::{EngineConfig, Entity, OwnerUpdate, VisibilityEngine};
use crate::esi::types::{Blueprint, Contract, IndustryJob, Starbase};
use crate::esi::EsiClient;
use crate::expiry::{ExpiryRegistry, RefreshSubscription};
use crate::owner::{Owner, OwnerDirectory, OwnerKind};
use crate::registry::StoreRegistry;
use crate::store::KeyValueStore;

pub const SCOPE_CHARACTER_CONTRACTS: &str = "esi-contracts.read_character_contracts.v1";
pub const SCOPE_CORPORATION_CONTRACTS: &str = "esi-contracts.read_corporation_contracts.v1";
pub const SCOPE_CHARACTER_JOBS: &str = "esi-industry.read_character_jobs.v1";
pub const SCOPE_CORPORATION_JOBS: &str = "esi-industry.read_corporation_jobs.v1";
pub const SCOPE_CHARACTER_BLUEPRINTS: &str = "esi-characters.read_blueprints.v1";
pub const SCOPE_CORPORATION_BLUEPRINTS: &str = "esi-corporations.read_blueprints.v1";
pub const SCOPE_CORPORATION_STARBASES: &str = "esi-corporations.read_starbases.v1";

/// Shared services every engine is built on.
pub struct Services<S> {
  pub store: Arc<S>,
  pub expiry: Arc<ExpiryRegistry<S>>,
  pub directory: Arc<dyn OwnerDirectory>,
  pub esi: EsiClient,
}

type Engine<T, S> = Arc<VisibilityEngine<T, S>>;
type ScopeFn = fn(OwnerKind) -> Option<&'static str>;

pub struct Catalog<S: KeyValueStore + 'static> {
  pub contracts: Engine<Contract, S>,
  pub industry_jobs: Engine<IndustryJob, S>,
  pub blueprints: Engine<Blueprint, S>,
  pub starbases: Engine<Starbase, S>,
  pub contract_items: Arc<ContractItemsStore<S>>,
  subscriptions: Vec<RefreshSubscription>,
}

/// `/characters/<id>/<segment>/` or `/corporations/<id>/<segment>/`.
fn endpoint_path(owner: &Owner, segment: &str) -> String {
  format!("/{}s/{}/{}/", owner.kind, owner.id, segment)
}

fn contract_scope(kind: OwnerKind) -> Option<&'static str> {
  Some(match kind {
    OwnerKind::Character => SCOPE_CHARACTER_CONTRACTS,
    OwnerKind::Corporation => SCOPE_CORPORATION_CONTRACTS,
  })
}

fn job_scope(kind: OwnerKind) -> Option<&'static str> {
  Some(match kind {
    OwnerKind::Character => SCOPE_CHARACTER_JOBS,
    OwnerKind::Corporation => SCOPE_CORPORATION_JOBS,
  })
}

fn blueprint_scope(kind: OwnerKind) -> Option<&'static str> {
  Some(match kind {
    OwnerKind::Character => SCOPE_CHARACTER_BLUEPRINTS,
    OwnerKind::Corporation => SCOPE_CORPORATION_BLUEPRINTS,
  })
}

/// Starbases only exist for corporations.
fn starbase_scope(kind: OwnerKind) -> Option<&'static str> {
  match kind {
    OwnerKind::Character => None,
    OwnerKind::Corporation => Some(SCOPE_CORPORATION_STARBASES),
  }
}

fn collection<T: Entity>(
  esi: &EsiClient,
  name: &str,
  scope: ScopeFn,
  segment: &'static str,
) -> EngineConfig<T> {
  let esi = esi.clone();
  EngineConfig::new(name)
    .required_scope(scope)
    .endpoint(move |owner| endpoint_path(owner, segment))
    .fetcher(move |owner, etag| {
      let esi = esi.clone();
      async move {
        let path = endpoint_path(&owner, segment);
        esi.fetch_collection(&owner, &path, etag.as_deref()).await
      }
    })
}

/// Queue item fetches for the item-bearing contracts in an owner's result.
fn schedule_items<S: KeyValueStore + 'static>(
  items: &Arc<ContractItemsStore<S>>,
  update: &OwnerUpdate<Contract>,
) {
  let newly_visible = update.newly_visible().count();
  let scheduled = update
    .records
    .iter()
    .filter(|c| c.needs_items())
    .filter(|c| items.schedule(c.contract_id, update.owner.source()))
    .count();
  if scheduled > 0 {
    debug!(owner = %update.owner.key(), newly_visible, scheduled, "Queued contract item fetches");
  }
}

fn new_engine<T: Entity, S: KeyValueStore + 'static>(
  services: &Services<S>,
  config: EngineConfig<T>,
) -> Result<Engine<T, S>> {
  VisibilityEngine::new(
    config,
    services.store.clone(),
    services.expiry.clone(),
    services.directory.clone(),
  )
}

fn counts<T: Entity, S: KeyValueStore + 'static>(
  engine: &VisibilityEngine<T, S>,
) -> (String, BTreeMap<String, usize>) {
  let counts = engine
    .visibility_map()
    .into_iter()
    .map(|(owner, ids)| (owner, ids.len()))
    .collect();
  (engine.name().to_string(), counts)
}

impl<S: KeyValueStore + 'static> Catalog<S> {
  /// Build one engine per entity kind and bind its refresh callback. Must run
  /// inside a tokio runtime.
  pub fn build(services: &Services<S>, sync: &SyncConfig) -> Result<Self> {
    let esi = services.esi.clone();
    let contract_items = ContractItemsStore::new(
      services.store.clone(),
      services.directory.clone(),
      sync.item_fetch_concurrency,
      move |owner, contract_id| {
        let esi = esi.clone();
        async move { esi.fetch_contract_items(&owner, contract_id).await }
      },
    );

    let esi = &services.esi;
    let on_owner = contract_items.clone();
    let on_batch = contract_items.clone();
    let contracts = collection::<Contract>(esi, "contracts", contract_scope, "contracts")
      .after_owner_update(move |update| schedule_items(&on_owner, update))
      .after_batch_update(move |updates| {
        for update in updates {
          schedule_items(&on_batch, update);
        }
      });

    let catalog = Self {
      contracts: new_engine(services, contracts)?,
      industry_jobs: new_engine(
        services,
        collection(esi, "industry_jobs", job_scope, "industry/jobs"),
      )?,
      blueprints: new_engine(
        services,
        collection(esi, "blueprints", blueprint_scope, "blueprints"),
      )?,
      starbases: new_engine(
        services,
        collection(esi, "starbases", starbase_scope, "starbases").owner_kind(OwnerKind::Corporation),
      )?,
      contract_items,
      subscriptions: Vec::new(),
    };

    Ok(catalog.bind_refresh())
  }

  fn bind_refresh(mut self) -> Self {
    self.subscriptions = vec![
      self.contracts.register_refresh("/contracts/"),
      self.industry_jobs.register_refresh("/industry/jobs/"),
      self.blueprints.register_refresh("/blueprints/"),
      self.starbases.register_refresh("/starbases/"),
    ];
    self
  }

  /// Detach every engine from the expiry registry's refresh triggers.
  pub fn unbind_refresh(&mut self) {
    for subscription in self.subscriptions.drain(..) {
      subscription.unsubscribe();
    }
  }

  /// Register every store. Contract items go last so a registry-wide update
  /// drains their queue after the contracts that feed it.
  pub fn register_all(&self, registry: &StoreRegistry) {
    registry.register(self.contracts.clone());
    registry.register(self.industry_jobs.clone());
    registry.register(self.blueprints.clone());
    registry.register(self.starbases.clone());
    registry.register(self.contract_items.clone());
  }

  /// Drop items of contracts no owner can see anymore. Does nothing until
  /// the contracts engine has loaded.
  pub fn prune_contract_items(&self) -> Result<usize> {
    if !self.contracts.is_initialized() {
      return Ok(0);
    }
    self.contract_items.retain(&self.contracts.record_ids())
  }

  /// Visible record counts per owner for every engine.
  pub fn visibility_counts(&self) -> Vec<(String, BTreeMap<String, usize>)> {
    vec![
      counts(&self.contracts),
      counts(&self.industry_jobs),
      counts(&self.blueprints),
      counts(&self.starbases),
    ]
  }

  /// Queue item fetches for stored contracts that have none yet, using each
  /// contract's source owner. Returns how many were queued.
  pub fn backfill_contract_items(&self) -> usize {
    let mut scheduled = 0;
    for id in self.contracts.record_ids() {
      let Some(stored) = self.contracts.record(id) else {
        continue;
      };
      if stored.item.needs_items() && self.contract_items.schedule(id, stored.source) {
        scheduled += 1;
      }
    }
    scheduled
  }
}
