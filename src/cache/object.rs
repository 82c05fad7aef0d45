//! Core object model for the coherence engine.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Stable identifier for a class of cached entities.
///
/// Every registry map is keyed by this token. Tokens are either declared as
/// constants with [`TypeToken::new`] or interned at runtime from configuration
/// with [`TypeToken::intern`]; two tokens with the same name are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeToken(&'static str);

static INTERNED: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();

impl TypeToken {
  /// Declare a token from a static name (e.g. `TypeToken::new("article")`).
  pub const fn new(name: &'static str) -> Self {
    Self(name)
  }

  /// Intern a token name read at runtime. Each distinct name is allocated once.
  pub fn intern(name: &str) -> Self {
    let table = INTERNED.get_or_init(Default::default);
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = table.get(name) {
      return Self(existing);
    }

    let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
    table.insert(leaked);
    Self(leaked)
  }

  pub fn name(&self) -> &'static str {
    self.0
  }
}

impl fmt::Display for TypeToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.0)
  }
}

impl Serialize for TypeToken {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(self.0)
  }
}

impl<'de> Deserialize<'de> for TypeToken {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    let name = String::deserialize(deserializer)?;
    Ok(Self::intern(&name))
  }
}

/// Trait for domain entities that can be turned into cache objects.
///
/// Implementors provide a key unique within their type token and an opaque
/// version string; the coherence engine only ever compares versions for
/// equality.
pub trait Cacheable: Serialize + DeserializeOwned {
  /// Unique identifier within the type token (e.g. article slug, user id)
  fn cache_key(&self) -> String;

  /// Current version of the entity (etag, revision, updated timestamp...)
  fn version(&self) -> String;

  /// Token naming the entity class
  fn type_token() -> TypeToken;

  /// Caller-defined marker to skip the entity during reconciliation.
  fn is_ignored(&self) -> bool {
    false
  }
}

/// A versioned cached entity.
///
/// Immutable once built: a changed entity is a new `CacheObject` with the same
/// id and a different version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheObject {
  id: String,
  token: TypeToken,
  version: String,
  ignored: bool,
  payload: Value,
}

impl CacheObject {
  pub fn new(
    id: impl Into<String>,
    token: TypeToken,
    version: impl Into<String>,
    payload: Value,
  ) -> Self {
    Self {
      id: id.into(),
      token,
      version: version.into(),
      ignored: false,
      payload,
    }
  }

  /// Mark the object as ignored while building it.
  pub fn with_ignored(mut self, ignored: bool) -> Self {
    self.ignored = ignored;
    self
  }

  /// Encode a domain entity as a cache object.
  pub fn from_entity<T: Cacheable>(entity: &T) -> Result<Self> {
    let payload =
      serde_json::to_value(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

    Ok(
      Self::new(entity.cache_key(), T::type_token(), entity.version(), payload)
        .with_ignored(entity.is_ignored()),
    )
  }

  /// Decode the payload back into a domain entity.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_value(self.payload.clone())
      .map_err(|e| eyre!("Failed to deserialize {} '{}': {}", self.token, self.id, e))
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn token(&self) -> TypeToken {
    self.token
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn is_ignored(&self) -> bool {
    self.ignored
  }

  pub fn payload(&self) -> &Value {
    &self.payload
  }
}

/// Persisted shape of a cache object; the token is implied by where it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
  pub id: String,
  pub version: String,
  #[serde(default)]
  pub ignored: bool,
  pub payload: Value,
}

impl ObjectRecord {
  pub fn into_object(self, token: TypeToken) -> CacheObject {
    CacheObject::new(self.id, token, self.version, self.payload).with_ignored(self.ignored)
  }
}

impl From<&CacheObject> for ObjectRecord {
  fn from(object: &CacheObject) -> Self {
    Self {
      id: object.id.clone(),
      version: object.version.clone(),
      ignored: object.ignored,
      payload: object.payload.clone(),
    }
  }
}

/// Result of a remote version checkout.
#[derive(Debug, Clone, Default)]
pub struct VersionPackage {
  /// Remote version per requested key
  versions: HashMap<String, String>,
  /// Requested keys the remote chose to skip
  ignored: Vec<String>,
  /// Full objects, when the remote answered with payloads
  objects: Option<Vec<CacheObject>>,
}

impl VersionPackage {
  pub fn new(versions: HashMap<String, String>, ignored: Vec<String>) -> Self {
    Self {
      versions,
      ignored,
      objects: None,
    }
  }

  pub fn with_objects(mut self, objects: Vec<CacheObject>) -> Self {
    self.objects = Some(objects);
    self
  }

  pub fn versions(&self) -> &HashMap<String, String> {
    &self.versions
  }

  pub fn ignored(&self) -> &[String] {
    &self.ignored
  }

  pub fn objects(&self) -> Option<&[CacheObject]> {
    self.objects.as_deref()
  }

  pub fn into_objects(self) -> Option<Vec<CacheObject>> {
    self.objects
  }
}

/// Reconciled outcome of a single download call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadPackage {
  request_keys: Vec<String>,
  new: Vec<CacheObject>,
  cached: Vec<CacheObject>,
  updated: Vec<CacheObject>,
  ignored: Vec<String>,
}

impl DownloadPackage {
  pub(crate) fn new(
    request_keys: Vec<String>,
    new: Vec<CacheObject>,
    cached: Vec<CacheObject>,
    updated: Vec<CacheObject>,
    ignored: Vec<String>,
  ) -> Self {
    Self {
      request_keys,
      new,
      cached,
      updated,
      ignored,
    }
  }

  pub fn request_keys(&self) -> &[String] {
    &self.request_keys
  }

  pub fn new_objects(&self) -> &[CacheObject] {
    &self.new
  }

  pub fn cached(&self) -> &[CacheObject] {
    &self.cached
  }

  pub fn updated(&self) -> &[CacheObject] {
    &self.updated
  }

  pub fn ignored(&self) -> &[String] {
    &self.ignored
  }

  /// Keys of every classified object: new, then cached, then updated.
  pub fn non_ignored_keys(&self) -> Vec<String> {
    self.objects().map(|o| o.id.clone()).collect()
  }

  /// Look up a classified object by key.
  pub fn find(&self, key: &str) -> Option<&CacheObject> {
    self.objects().find(|o| o.id == key)
  }

  fn objects(&self) -> impl Iterator<Item = &CacheObject> {
    self.new.iter().chain(&self.cached).chain(&self.updated)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Article {
    slug: String,
    revision: u32,
    title: String,
  }

  impl Cacheable for Article {
    fn cache_key(&self) -> String {
      self.slug.clone()
    }

    fn version(&self) -> String {
      self.revision.to_string()
    }

    fn type_token() -> TypeToken {
      TypeToken::new("article")
    }
  }

  #[test]
  fn test_interned_token_equals_static_token() {
    let interned = TypeToken::intern("article");
    assert_eq!(interned, TypeToken::new("article"));
    assert_eq!(TypeToken::intern("article").name(), "article");
    assert_ne!(interned, TypeToken::intern("comment"));
  }

  #[test]
  fn test_token_deserializes_through_interning() {
    let token: TypeToken = serde_json::from_str("\"comment\"").unwrap();
    assert_eq!(token, TypeToken::new("comment"));
    assert_eq!(serde_json::to_string(&token).unwrap(), "\"comment\"");
  }

  #[test]
  fn test_entity_encode_decode() {
    let article = Article {
      slug: "intro".to_string(),
      revision: 3,
      title: "Intro".to_string(),
    };

    let object = CacheObject::from_entity(&article).unwrap();
    assert_eq!(object.id(), "intro");
    assert_eq!(object.version(), "3");
    assert_eq!(object.token(), TypeToken::new("article"));
    assert!(!object.is_ignored());

    let decoded: Article = object.decode().unwrap();
    assert_eq!(decoded, article);
  }

  #[test]
  fn test_record_keeps_ignored_flag() {
    let token = TypeToken::new("article");
    let object = CacheObject::new("a", token, "1", json!({"x": 1})).with_ignored(true);

    let record = ObjectRecord::from(&object);
    assert_eq!(record.into_object(token), object);
  }

  #[test]
  fn test_download_package_lookup() {
    let token = TypeToken::new("article");
    let package = DownloadPackage::new(
      vec!["a".into(), "b".into(), "c".into()],
      vec![CacheObject::new("a", token, "1", Value::Null)],
      vec![CacheObject::new("b", token, "1", Value::Null)],
      vec![],
      vec!["c".into()],
    );

    assert_eq!(package.non_ignored_keys(), vec!["a", "b"]);
    assert!(package.find("b").is_some());
    assert!(package.find("c").is_none());
  }
}
