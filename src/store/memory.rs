//! In-memory implementation of the key-value store.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::traits::KeyValueStore;

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

/// Storage that keeps everything in process memory.
/// Used in tests and when the on-disk cache is disabled.
#[derive(Default)]
pub struct MemoryStore {
  collections: Mutex<Collections>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Collections>> {
    self
      .collections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
impl MemoryStore {
  /// Number of entries in a collection.
  pub fn len(&self, collection: &str) -> usize {
    self
      .lock()
      .map(|c| c.get(collection).map_or(0, BTreeMap::len))
      .unwrap_or(0)
  }
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
  serde_json::to_value(value).map_err(|e| eyre!("Failed to serialize value: {}", e))
}

impl KeyValueStore for MemoryStore {
  fn get_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<(String, T)>> {
    let collections = self.lock()?;
    let Some(entries) = collections.get(collection) else {
      return Ok(Vec::new());
    };

    let decoded = entries
      .iter()
      .filter_map(|(key, value)| match serde_json::from_value(value.clone()) {
        Ok(v) => Some((key.clone(), v)),
        Err(e) => {
          warn!(collection, key = %key, error = %e, "Skipping undecodable entry");
          None
        }
      })
      .collect();

    Ok(decoded)
  }

  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
    let value = encode(value)?;
    self
      .lock()?
      .entry(collection.to_string())
      .or_default()
      .insert(key.to_string(), value);
    Ok(())
  }

  fn put_batch<T: Serialize>(&self, collection: &str, entries: &[(String, T)]) -> Result<()> {
    // Encode everything first so a bad value leaves the collection untouched.
    let encoded = entries
      .iter()
      .map(|(k, v)| Ok((k.clone(), encode(v)?)))
      .collect::<Result<Vec<_>>>()?;

    self
      .lock()?
      .entry(collection.to_string())
      .or_default()
      .extend(encoded);
    Ok(())
  }

  fn delete(&self, collection: &str, key: &str) -> Result<()> {
    if let Some(entries) = self.lock()?.get_mut(collection) {
      entries.remove(key);
    }
    Ok(())
  }

  fn delete_batch(&self, collection: &str, keys: &[String]) -> Result<()> {
    if let Some(entries) = self.lock()?.get_mut(collection) {
      for key in keys {
        entries.remove(key);
      }
    }
    Ok(())
  }

  fn clear(&self, collection: &str) -> Result<()> {
    self.lock()?.remove(collection);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_roundtrip_in_key_order() {
    let store = MemoryStore::new();
    store.put("c", "2", &"two").unwrap();
    store.put("c", "1", &"one").unwrap();

    let all: Vec<(String, String)> = store.get_all("c").unwrap();
    assert_eq!(
      all,
      vec![
        ("1".to_string(), "one".to_string()),
        ("2".to_string(), "two".to_string())
      ]
    );
  }

  #[test]
  fn test_missing_collection_is_empty() {
    let store = MemoryStore::new();
    assert!(store.get_all::<String>("nothing").unwrap().is_empty());
    store.delete("nothing", "k").unwrap();
    assert_eq!(store.len("nothing"), 0);
  }

  #[test]
  fn test_batch_and_clear() {
    let store = MemoryStore::new();
    store
      .put_batch("c", &[("a".to_string(), 1), ("b".to_string(), 2)])
      .unwrap();
    store.delete_batch("c", &["a".to_string()]).unwrap();
    assert_eq!(store.len("c"), 1);

    store.clear("c").unwrap();
    assert_eq!(store.len("c"), 0);
  }
}
