//! SQLite implementation of the key-value store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::traits::KeyValueStore;

/// SQLite-based key-value storage.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("esi-mirror").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, key)
);
"#;

impl KeyValueStore for SqliteStore {
  fn get_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<(String, T)>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key, value FROM kv WHERE collection = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query {}: {}", collection, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read {}: {}", collection, e))?;

    let entries = rows
      .into_iter()
      .filter_map(|(key, data)| match serde_json::from_slice(&data) {
        Ok(value) => Some((key, value)),
        Err(e) => {
          warn!(collection, key = %key, error = %e, "Skipping undecodable entry");
          None
        }
      })
      .collect();

    Ok(entries)
  }

  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;

    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO kv (collection, key, value, updated_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![collection, key, data],
      )
      .map_err(|e| eyre!("Failed to store {}/{}: {}", collection, key, e))?;

    Ok(())
  }

  fn put_batch<T: Serialize>(&self, collection: &str, entries: &[(String, T)]) -> Result<()> {
    if entries.is_empty() {
      return Ok(());
    }

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    {
      let mut stmt = tx
        .prepare_cached(
          "INSERT OR REPLACE INTO kv (collection, key, value, updated_at)
           VALUES (?, ?, ?, datetime('now'))",
        )
        .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

      for (key, value) in entries {
        let data =
          serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;
        stmt
          .execute(params![collection, key, data])
          .map_err(|e| eyre!("Failed to store {}/{}: {}", collection, key, e))?;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, collection: &str, key: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "DELETE FROM kv WHERE collection = ? AND key = ?",
        params![collection, key],
      )
      .map_err(|e| eyre!("Failed to delete {}/{}: {}", collection, key, e))?;

    Ok(())
  }

  fn delete_batch(&self, collection: &str, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
      return Ok(());
    }

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    {
      let mut stmt = tx
        .prepare_cached("DELETE FROM kv WHERE collection = ? AND key = ?")
        .map_err(|e| eyre!("Failed to prepare delete: {}", e))?;

      for key in keys {
        stmt
          .execute(params![collection, key])
          .map_err(|e| eyre!("Failed to delete {}/{}: {}", collection, key, e))?;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn clear(&self, collection: &str) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM kv WHERE collection = ?", params![collection])
      .map_err(|e| eyre!("Failed to clear {}: {}", collection, e))?;

    Ok(())
  }
}
