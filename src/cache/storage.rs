//! Storage facade trait, SQLite implementation and an in-process map store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::object::{CacheObject, TypeToken};

/// Trait for cache storage backends.
///
/// Objects are addressed by `(key, token)`. Implementations must tolerate
/// repeated puts and removes of the same key; each call is atomic on its own.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
  /// Get a single object by key.
  async fn get(&self, key: &str, token: TypeToken) -> Result<Option<CacheObject>>;

  /// Store an object, replacing any previous object with the same key.
  async fn put(&self, object: &CacheObject) -> Result<()>;

  /// Remove an object. Removing a missing key is not an error.
  async fn remove(&self, key: &str, token: TypeToken) -> Result<()>;

  async fn exists(&self, key: &str, token: TypeToken) -> Result<bool> {
    Ok(self.get(key, token).await?.is_some())
  }

  /// Get every stored object among `keys`, in request order.
  async fn get_many(&self, keys: &[String], token: TypeToken) -> Result<Vec<CacheObject>> {
    let mut objects = Vec::with_capacity(keys.len());
    for key in keys {
      if let Some(object) = self.get(key, token).await? {
        objects.push(object);
      }
    }
    Ok(objects)
  }

  async fn remove_many(&self, keys: &[String], token: TypeToken) -> Result<()> {
    for key in keys {
      self.remove(key, token).await?;
    }
    Ok(())
  }
}

/// Storage kept in a process-local map. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
  objects: Mutex<HashMap<(TypeToken, String), CacheObject>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn objects(&self) -> Result<MutexGuard<'_, HashMap<(TypeToken, String), CacheObject>>> {
    self
      .objects
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Number of stored objects across all tokens.
  pub fn len(&self) -> Result<usize> {
    Ok(self.objects()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.objects()?.is_empty())
  }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
  async fn get(&self, key: &str, token: TypeToken) -> Result<Option<CacheObject>> {
    Ok(self.objects()?.get(&(token, key.to_string())).cloned())
  }

  async fn put(&self, object: &CacheObject) -> Result<()> {
    self
      .objects()?
      .insert((object.token(), object.id().to_string()), object.clone());
    Ok(())
  }

  async fn remove(&self, key: &str, token: TypeToken) -> Result<()> {
    self.objects()?.remove(&(token, key.to_string()));
    Ok(())
  }
}

#[async_trait]
impl<T: ObjectStorage + ?Sized> ObjectStorage for Box<T> {
  async fn get(&self, key: &str, token: TypeToken) -> Result<Option<CacheObject>> {
    (**self).get(key, token).await
  }

  async fn put(&self, object: &CacheObject) -> Result<()> {
    (**self).put(object).await
  }

  async fn remove(&self, key: &str, token: TypeToken) -> Result<()> {
    (**self).remove(key, token).await
  }

  async fn exists(&self, key: &str, token: TypeToken) -> Result<bool> {
    (**self).exists(key, token).await
  }

  async fn get_many(&self, keys: &[String], token: TypeToken) -> Result<Vec<CacheObject>> {
    (**self).get_many(keys, token).await
  }

  async fn remove_many(&self, keys: &[String], token: TypeToken) -> Result<()> {
    (**self).remove_many(keys, token).await
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database that lives as long as the storage.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// When an object was last written, if it is stored.
  pub fn cached_at(&self, key: &str, token: TypeToken) -> Result<Option<DateTime<Utc>>> {
    let conn = self.conn()?;

    let cached_at: Option<String> = conn
      .query_row(
        "SELECT cached_at FROM object_cache WHERE type_token = ? AND object_key = ?",
        params![token.name(), key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached_at for {}: {}", key, e))?;

    cached_at.as_deref().map(parse_datetime).transpose()
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Versioned object cache (payload stored as serialized JSON)
CREATE TABLE IF NOT EXISTS object_cache (
    type_token TEXT NOT NULL,
    object_key TEXT NOT NULL,
    version TEXT NOT NULL,
    ignored INTEGER NOT NULL DEFAULT 0,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (type_token, object_key)
);
"#;

#[async_trait]
impl ObjectStorage for SqliteStorage {
  async fn get(&self, key: &str, token: TypeToken) -> Result<Option<CacheObject>> {
    let conn = self.conn()?;

    let row: Option<(String, bool, Vec<u8>)> = conn
      .query_row(
        "SELECT version, ignored, data FROM object_cache
         WHERE type_token = ? AND object_key = ?",
        params![token.name(), key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query object {}: {}", key, e))?;

    match row {
      Some((version, ignored, data)) => {
        let payload = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize object {}: {}", key, e))?;
        Ok(Some(
          CacheObject::new(key, token, version, payload).with_ignored(ignored),
        ))
      }
      None => Ok(None),
    }
  }

  async fn put(&self, object: &CacheObject) -> Result<()> {
    let conn = self.conn()?;
    let data = serde_json::to_vec(object.payload())
      .map_err(|e| eyre!("Failed to serialize object {}: {}", object.id(), e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO object_cache (type_token, object_key, version, ignored, data, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![
          object.token().name(),
          object.id(),
          object.version(),
          object.is_ignored(),
          data
        ],
      )
      .map_err(|e| eyre!("Failed to store object {}: {}", object.id(), e))?;

    Ok(())
  }

  async fn remove(&self, key: &str, token: TypeToken) -> Result<()> {
    self
      .conn()?
      .execute(
        "DELETE FROM object_cache WHERE type_token = ? AND object_key = ?",
        params![token.name(), key],
      )
      .map_err(|e| eyre!("Failed to remove object {}: {}", key, e))?;

    Ok(())
  }

  async fn exists(&self, key: &str, token: TypeToken) -> Result<bool> {
    let conn = self.conn()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM object_cache WHERE type_token = ? AND object_key = ?",
        params![token.name(), key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query object {}: {}", key, e))?;

    Ok(found.is_some())
  }

  async fn remove_many(&self, keys: &[String], token: TypeToken) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for key in keys {
      tx.execute(
        "DELETE FROM object_cache WHERE type_token = ? AND object_key = ?",
        params![token.name(), key],
      )
      .map_err(|e| eyre!("Failed to remove object {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const ARTICLE: TypeToken = TypeToken::new("article");
  const COMMENT: TypeToken = TypeToken::new("comment");

  async fn exercise(storage: &dyn ObjectStorage) {
    let first = CacheObject::new("a", ARTICLE, "1", json!({"title": "first"}));
    let second = CacheObject::new("a", ARTICLE, "2", json!({"title": "second"}));

    assert!(storage.get("a", ARTICLE).await.unwrap().is_none());
    assert!(!storage.exists("a", ARTICLE).await.unwrap());

    storage.put(&first).await.unwrap();
    storage.put(&first).await.unwrap();
    assert_eq!(storage.get("a", ARTICLE).await.unwrap(), Some(first));

    storage.put(&second).await.unwrap();
    assert_eq!(storage.get("a", ARTICLE).await.unwrap(), Some(second));

    // Same key under another token is a different object
    assert!(!storage.exists("a", COMMENT).await.unwrap());

    storage.remove("a", ARTICLE).await.unwrap();
    storage.remove("a", ARTICLE).await.unwrap();
    assert!(!storage.exists("a", ARTICLE).await.unwrap());
  }

  async fn exercise_batches(storage: &dyn ObjectStorage) {
    for id in ["x", "y", "z"] {
      storage
        .put(&CacheObject::new(id, ARTICLE, "1", json!(id)).with_ignored(id == "z"))
        .await
        .unwrap();
    }

    let keys: Vec<String> = ["z", "missing", "x"].iter().map(|k| k.to_string()).collect();
    let found = storage.get_many(&keys, ARTICLE).await.unwrap();
    let ids: Vec<&str> = found.iter().map(|o| o.id()).collect();
    assert_eq!(ids, vec!["z", "x"]);
    assert!(found[0].is_ignored());

    storage.remove_many(&keys, ARTICLE).await.unwrap();
    assert!(storage.exists("y", ARTICLE).await.unwrap());
    assert!(!storage.exists("x", ARTICLE).await.unwrap());
  }

  #[tokio::test]
  async fn test_memory_storage() {
    let storage = MemoryStorage::new();
    exercise(&storage).await;
    exercise_batches(&storage).await;
    assert_eq!(storage.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_sqlite_storage() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    exercise(&storage).await;
    exercise_batches(&storage).await;
  }

  #[tokio::test]
  async fn test_sqlite_storage_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage
        .put(&CacheObject::new("a", ARTICLE, "7", json!([1, 2])))
        .await
        .unwrap();
      assert!(storage.cached_at("a", ARTICLE).unwrap().is_some());
      assert!(storage.cached_at("b", ARTICLE).unwrap().is_none());
    }

    let reopened = SqliteStorage::open(&path).unwrap();
    let object = reopened.get("a", ARTICLE).await.unwrap().unwrap();
    assert_eq!(object.version(), "7");
    assert_eq!(object.payload(), &json!([1, 2]));
  }
}
