//! Owner-scoped visibility engine.
//!
//! One [`VisibilityEngine`] exists per entity kind. It fetches each owner's
//! complete view of an endpoint, stores every record once no matter how many
//! owners can see it, and keeps a visibility set per owner. A record lives as
//! long as at least one owner's visibility set references it.
//!
//! # Example
//!
//! ```ignore
//! let config = EngineConfig::new("contracts")
//!   .required_scope(|kind| match kind {
//!     OwnerKind::Character => Some("esi-contracts.read_character_contracts.v1"),
//!     OwnerKind::Corporation => Some("esi-contracts.read_corporation_contracts.v1"),
//!   })
//!   .endpoint(|owner| format!("/{}s/{}/contracts/", owner.kind, owner.id))
//!   .fetcher(move |owner, etag| {
//!     let esi = esi.clone();
//!     async move { esi.fetch_collection(&owner, &path, etag.as_deref()).await }
//!   });
//!
//! let engine = VisibilityEngine::new(config, store, expiry, directory)?;
//! engine.init().await;
//! engine.update(false).await;
//! ```

mod config;
mod secondary;
mod state;
#[cfg(test)]
pub(crate) mod testing;
mod visibility;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::owner::SourceOwner;

pub use config::{EngineConfig, OwnerUpdate};
pub use secondary::SecondaryQueue;
pub use state::EngineStatus;
pub use visibility::VisibilityEngine;

/// A record type the engine can deduplicate and persist.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Stable identity used as the dedup key.
  fn record_id(&self) -> i64;
}

/// One deduplicated record and the owner whose fetch last produced it.
///
/// `source` picks credentials for secondary fetches; it says nothing about
/// who can see the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord<T> {
  pub item: T,
  pub source: SourceOwner,
}

/// What a fetch function hands back for one owner.
#[derive(Debug, Clone)]
pub enum FetchOutcome<T> {
  /// The complete current view of the endpoint for this owner.
  Modified {
    records: Vec<T>,
    expires_at: DateTime<Utc>,
    etag: Option<String>,
  },
  /// The upstream confirmed the stored ETag is still current.
  NotModified {
    expires_at: DateTime<Utc>,
    etag: Option<String>,
  },
}

/// What one engine operation did. Errors are also mirrored into
/// [`EngineStatus`], which keeps the last one until it is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
  /// Stored state changed.
  pub changed: bool,
  /// Error raised by this call.
  pub error: Option<String>,
}

impl Outcome {
  pub fn into_result(self) -> Result<()> {
    match self.error {
      Some(message) => Err(eyre!(message)),
      None => Ok(()),
    }
  }
}
