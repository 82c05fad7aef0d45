//! Fixed-capacity in-memory front for any storage backend, using Moka.

use async_trait::async_trait;
use color_eyre::Result;
use moka::future::Cache as MokaCache;
use tracing::debug;

use super::object::{CacheObject, TypeToken};
use super::storage::ObjectStorage;

/// Write-through memory cache in front of a slower backend.
///
/// Reads hit memory first and fall back to the backend, populating memory on
/// the way out. Writes and removes go to the backend first, so memory never
/// holds an object the backend refused.
pub struct MemoryCachedStorage<S: ObjectStorage> {
  cache: MokaCache<(TypeToken, String), CacheObject>,
  backend: S,
}

impl<S: ObjectStorage> MemoryCachedStorage<S> {
  /// Wrap `backend` with a memory cache holding at most `capacity` objects.
  pub fn new(backend: S, capacity: u64) -> Self {
    let cache = MokaCache::builder().max_capacity(capacity).build();

    debug!(capacity, "Memory cache created");

    Self { cache, backend }
  }

  pub fn backend(&self) -> &S {
    &self.backend
  }

  #[cfg(test)]
  async fn cached_entries(&self) -> u64 {
    self.cache.run_pending_tasks().await;
    self.cache.entry_count()
  }
}

#[async_trait]
impl<S: ObjectStorage> ObjectStorage for MemoryCachedStorage<S> {
  async fn get(&self, key: &str, token: TypeToken) -> Result<Option<CacheObject>> {
    let cache_key = (token, key.to_string());
    if let Some(object) = self.cache.get(&cache_key).await {
      return Ok(Some(object));
    }

    let object = self.backend.get(key, token).await?;
    if let Some(object) = &object {
      self.cache.insert(cache_key, object.clone()).await;
    }
    Ok(object)
  }

  async fn put(&self, object: &CacheObject) -> Result<()> {
    self.backend.put(object).await?;
    self
      .cache
      .insert((object.token(), object.id().to_string()), object.clone())
      .await;
    Ok(())
  }

  async fn remove(&self, key: &str, token: TypeToken) -> Result<()> {
    self.backend.remove(key, token).await?;
    self.cache.invalidate(&(token, key.to_string())).await;
    Ok(())
  }

  async fn exists(&self, key: &str, token: TypeToken) -> Result<bool> {
    if self.cache.contains_key(&(token, key.to_string())) {
      return Ok(true);
    }
    self.backend.exists(key, token).await
  }

  async fn remove_many(&self, keys: &[String], token: TypeToken) -> Result<()> {
    self.backend.remove_many(keys, token).await?;
    for key in keys {
      self.cache.invalidate(&(token, key.clone())).await;
    }
    Ok(())
  }
}
