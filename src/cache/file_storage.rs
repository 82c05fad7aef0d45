//! File-backed storage: one JSON document per object.
//!
//! Layout is `<root>/<token>/<sha256(key)>.json`, so arbitrary keys map to
//! safe, fixed-length file names.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::object::{CacheObject, ObjectRecord, TypeToken};
use super::storage::ObjectStorage;

pub struct FileStorage {
  root: PathBuf,
}

impl FileStorage {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn object_path(&self, key: &str, token: TypeToken) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let file_name = format!("{}.json", hex::encode(hasher.finalize()));

    self.root.join(token.name()).join(file_name)
  }
}

#[async_trait]
impl ObjectStorage for FileStorage {
  async fn get(&self, key: &str, token: TypeToken) -> Result<Option<CacheObject>> {
    let path = self.object_path(key, token);

    let data = match tokio::fs::read(&path).await {
      Ok(data) => data,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(eyre!("Failed to read {}: {}", path.display(), e)),
    };

    let record: ObjectRecord = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Failed to deserialize {}: {}", path.display(), e))?;

    Ok(Some(record.into_object(token)))
  }

  async fn put(&self, object: &CacheObject) -> Result<()> {
    let path = self.object_path(object.id(), object.token());

    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let data = serde_json::to_vec(&ObjectRecord::from(object))
      .map_err(|e| eyre!("Failed to serialize object {}: {}", object.id(), e))?;

    // Write then rename so readers never see a half-written file
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data)
      .await
      .map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
    tokio::fs::rename(&tmp, &path)
      .await
      .map_err(|e| eyre!("Failed to move {} into place: {}", path.display(), e))?;

    debug!(token = %object.token(), key = object.id(), "stored object file");
    Ok(())
  }

  async fn remove(&self, key: &str, token: TypeToken) -> Result<()> {
    let path = self.object_path(key, token);

    match tokio::fs::remove_file(&path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(eyre!("Failed to remove {}: {}", path.display(), e)),
    }
  }

  async fn exists(&self, key: &str, token: TypeToken) -> Result<bool> {
    let path = self.object_path(key, token);
    tokio::fs::try_exists(&path)
      .await
      .map_err(|e| eyre!("Failed to stat {}: {}", path.display(), e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const ARTICLE: TypeToken = TypeToken::new("article");

  #[tokio::test]
  async fn test_put_get_remove() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::new(dir.path());
    let object = CacheObject::new("path/with spaces?", ARTICLE, "4", json!({"n": 4}));

    assert!(storage.get(object.id(), ARTICLE).await.unwrap().is_none());

    storage.put(&object).await.unwrap();
    storage.put(&object).await.unwrap();
    assert!(storage.exists(object.id(), ARTICLE).await.unwrap());
    assert_eq!(
      storage.get(object.id(), ARTICLE).await.unwrap(),
      Some(object.clone())
    );

    storage.remove(object.id(), ARTICLE).await.unwrap();
    storage.remove(object.id(), ARTICLE).await.unwrap();
    assert!(!storage.exists(object.id(), ARTICLE).await.unwrap());
  }

  #[tokio::test]
  async fn test_files_are_grouped_by_token() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::new(dir.path());

    storage
      .put(&CacheObject::new("a", ARTICLE, "1", json!(null)))
      .await
      .unwrap();

    let token_dir = dir.path().join("article");
    let entries: Vec<_> = std::fs::read_dir(&token_dir).unwrap().collect();
    assert_eq!(entries.len(), 1);
  }
}
