//! Serde types matching the remote object API.
//!
//! These are kept apart from [`CacheObject`] so the wire format can evolve
//! without touching the engine's object model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::cache::{CacheObject, TypeToken, VersionPackage};

/// Body of both `objects` and `versions` requests.
#[derive(Debug, Serialize)]
pub struct ApiKeysRequest<'a> {
  pub keys: &'a [String],
}

#[derive(Debug, Deserialize)]
pub struct ApiObject {
  pub id: String,
  pub version: String,
  #[serde(default)]
  pub ignored: bool,
  #[serde(default)]
  pub payload: Value,
}

impl ApiObject {
  pub fn into_object(self, token: TypeToken) -> CacheObject {
    CacheObject::new(self.id, token, self.version, self.payload).with_ignored(self.ignored)
  }
}

// ============================================================================
// Objects endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiObjectsResponse {
  #[serde(default)]
  pub objects: Vec<ApiObject>,
}

// ============================================================================
// Versions endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiVersionsResponse {
  #[serde(default)]
  pub versions: HashMap<String, String>,
  #[serde(default)]
  pub ignored: Vec<String>,
  /// Present when the remote answers with full payloads
  pub objects: Option<Vec<ApiObject>>,
}

impl ApiVersionsResponse {
  pub fn into_package(self, token: TypeToken) -> VersionPackage {
    let package = VersionPackage::new(self.versions, self.ignored);
    match self.objects {
      Some(objects) => {
        package.with_objects(objects.into_iter().map(|o| o.into_object(token)).collect())
      }
      None => package,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ARTICLE: TypeToken = TypeToken::new("article");

  #[test]
  fn test_versions_response_without_objects() {
    let response: ApiVersionsResponse = serde_json::from_str(
      r#"{"versions": {"a": "1", "b": "2"}, "ignored": ["c"]}"#,
    )
    .unwrap();

    let package = response.into_package(ARTICLE);
    assert_eq!(package.versions().len(), 2);
    assert_eq!(package.versions()["b"], "2");
    assert_eq!(package.ignored(), ["c".to_string()].as_slice());
    assert!(package.objects().is_none());
  }

  #[test]
  fn test_versions_response_with_objects() {
    let response: ApiVersionsResponse = serde_json::from_str(
      r#"{"versions": {"a": "1"}, "objects": [{"id": "a", "version": "1", "payload": {"x": 1}}]}"#,
    )
    .unwrap();

    let package = response.into_package(ARTICLE);
    let objects = package.objects().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].token(), ARTICLE);
    assert_eq!(objects[0].payload()["x"], 1);
  }

  #[test]
  fn test_objects_response_defaults() {
    let response: ApiObjectsResponse =
      serde_json::from_str(r#"{"objects": [{"id": "a", "version": "1", "ignored": true}]}"#)
        .unwrap();

    let object = response
      .objects
      .into_iter()
      .next()
      .unwrap()
      .into_object(ARTICLE);
    assert!(object.is_ignored());
    assert_eq!(object.payload(), &Value::Null);

    let empty: ApiObjectsResponse = serde_json::from_str("{}").unwrap();
    assert!(empty.objects.is_empty());
  }
}
