//! Core persistence trait.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};

/// Trait for key-value storage backends.
///
/// Each method is scoped to a named collection. Keys are opaque strings and
/// `get_all` returns entries in ascending key order. Values are serialized by
/// the backend, so callers hand over plain `Serialize` types.
pub trait KeyValueStore: Send + Sync {
  /// Load every entry of a collection.
  ///
  /// Entries that fail to deserialize are skipped and logged, not returned as
  /// errors.
  fn get_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<(String, T)>>;

  /// Insert or replace a single entry.
  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()>;

  /// Insert or replace many entries atomically.
  fn put_batch<T: Serialize>(&self, collection: &str, entries: &[(String, T)]) -> Result<()>;

  /// Remove a single entry. Missing keys are not an error.
  fn delete(&self, collection: &str, key: &str) -> Result<()>;

  /// Remove many entries atomically.
  fn delete_batch(&self, collection: &str, keys: &[String]) -> Result<()>;

  /// Remove every entry of a collection.
  fn clear(&self, collection: &str) -> Result<()>;
}
