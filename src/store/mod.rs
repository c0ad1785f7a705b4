//! Ordered key-value persistence scoped to named collections.
//!
//! Everything the mirror keeps on disk goes through [`KeyValueStore`]: expiry
//! records, deduplicated items, per-owner visibility sets and contract items.
//! The store has no business logic of its own.

mod memory;
mod sqlite;
mod traits;

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::KeyValueStore;

/// Backend selected at startup from the `cache` config section.
pub enum Backend {
  Sqlite(SqliteStore),
  Memory(MemoryStore),
}

impl KeyValueStore for Backend {
  fn get_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<(String, T)>> {
    match self {
      Self::Sqlite(s) => s.get_all(collection),
      Self::Memory(s) => s.get_all(collection),
    }
  }

  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
    match self {
      Self::Sqlite(s) => s.put(collection, key, value),
      Self::Memory(s) => s.put(collection, key, value),
    }
  }

  fn put_batch<T: Serialize>(&self, collection: &str, entries: &[(String, T)]) -> Result<()> {
    match self {
      Self::Sqlite(s) => s.put_batch(collection, entries),
      Self::Memory(s) => s.put_batch(collection, entries),
    }
  }

  fn delete(&self, collection: &str, key: &str) -> Result<()> {
    match self {
      Self::Sqlite(s) => s.delete(collection, key),
      Self::Memory(s) => s.delete(collection, key),
    }
  }

  fn delete_batch(&self, collection: &str, keys: &[String]) -> Result<()> {
    match self {
      Self::Sqlite(s) => s.delete_batch(collection, keys),
      Self::Memory(s) => s.delete_batch(collection, keys),
    }
  }

  fn clear(&self, collection: &str) -> Result<()> {
    match self {
      Self::Sqlite(s) => s.clear(collection),
      Self::Memory(s) => s.clear(collection),
    }
  }
}
