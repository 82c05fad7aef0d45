//! Per-type bookkeeping of monitored keys, their versions and pending retries.
//!
//! The registry is a plain state container owned by the coherence controller.
//! Every query against a token that is not being monitored returns an empty
//! result and every mutation is a no-op, so callers can probe optimistically.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::object::{CacheObject, TypeToken};

/// Tracking state for a single type token.
#[derive(Debug, Default)]
struct MonitorState {
  /// Tracked key -> last known version. The key set is the monitored key set.
  versions: BTreeMap<String, String>,
  /// Keys waiting for an automatic retry download
  retry_queue: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct MonitorRegistry {
  states: HashMap<TypeToken, MonitorState>,
}

impl MonitorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Begin tracking a token. Idempotent; existing state is kept.
  pub fn start_monitoring(&mut self, token: TypeToken) {
    self.states.entry(token).or_default();
  }

  /// Stop tracking a token and drop all of its versions and retry keys.
  pub fn stop_monitoring(&mut self, token: TypeToken) {
    self.states.remove(&token);
  }

  pub fn contains_type(&self, token: TypeToken) -> bool {
    self.states.contains_key(&token)
  }

  /// Monitored tokens in a stable order.
  pub fn monitored_types(&self) -> Vec<TypeToken> {
    let mut tokens: Vec<TypeToken> = self.states.keys().copied().collect();
    tokens.sort();
    tokens
  }

  /// The subsequence of `keys` currently tracked for `token`.
  pub fn find_keys_in_monitoring(&self, keys: &[String], token: TypeToken) -> Vec<String> {
    match self.states.get(&token) {
      Some(state) => keys
        .iter()
        .filter(|k| state.versions.contains_key(k.as_str()))
        .cloned()
        .collect(),
      None => Vec::new(),
    }
  }

  /// Every tracked key for `token`, sorted.
  pub fn tracked_keys(&self, token: TypeToken) -> Vec<String> {
    self
      .states
      .get(&token)
      .map(|s| s.versions.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub fn version_of(&self, key: &str, token: TypeToken) -> Option<&str> {
    self
      .states
      .get(&token)
      .and_then(|s| s.versions.get(key))
      .map(String::as_str)
  }

  /// Upsert `id -> version` for each object. No-op when `token` is not monitored.
  pub fn update_versions<'a, I>(&mut self, objects: I, token: TypeToken)
  where
    I: IntoIterator<Item = &'a CacheObject>,
  {
    let Some(state) = self.states.get_mut(&token) else {
      return;
    };

    for object in objects {
      state
        .versions
        .insert(object.id().to_string(), object.version().to_string());
    }
  }

  pub fn remove_versions(&mut self, keys: &[String], token: TypeToken) {
    if let Some(state) = self.states.get_mut(&token) {
      for key in keys {
        state.versions.remove(key);
      }
    }
  }

  /// Keys whose local version differs from, or is missing in, `remote_versions`.
  pub fn expired_keys(
    &self,
    keys: &[String],
    remote_versions: &HashMap<String, String>,
    token: TypeToken,
  ) -> Vec<String> {
    let Some(state) = self.states.get(&token) else {
      return Vec::new();
    };

    keys
      .iter()
      .filter(|key| {
        let local = state.versions.get(key.as_str());
        let remote = remote_versions.get(key.as_str());
        match (local, remote) {
          (Some(local), Some(remote)) => local != remote,
          _ => true,
        }
      })
      .cloned()
      .collect()
  }

  /// Whether the object's version differs from the registered one.
  /// An object with no registered version is treated as expired.
  pub fn monitored_object_is_expired(&self, object: &CacheObject) -> bool {
    match self.version_of(object.id(), object.token()) {
      Some(version) => version != object.version(),
      None => true,
    }
  }

  pub fn add_retry_keys(&mut self, keys: &[String], token: TypeToken) {
    if let Some(state) = self.states.get_mut(&token) {
      state.retry_queue.extend(keys.iter().cloned());
    }
  }

  pub fn remove_retry_keys(&mut self, keys: &[String], token: TypeToken) {
    if let Some(state) = self.states.get_mut(&token) {
      for key in keys {
        state.retry_queue.remove(key);
      }
    }
  }

  /// Keys pending a retry for `token`, sorted.
  pub fn retry_keys(&self, token: TypeToken) -> Vec<String> {
    self
      .states
      .get(&token)
      .map(|s| s.retry_queue.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn any_retry_pending(&self) -> bool {
    self.states.values().any(|s| !s.retry_queue.is_empty())
  }

  pub fn has_tracked_keys(&self) -> bool {
    self.states.values().any(|s| !s.versions.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Value;

  const ARTICLE: TypeToken = TypeToken::new("article");
  const COMMENT: TypeToken = TypeToken::new("comment");

  fn object(id: &str, version: &str) -> CacheObject {
    CacheObject::new(id, ARTICLE, version, Value::Null)
  }

  fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
  }

  fn monitored() -> MonitorRegistry {
    let mut registry = MonitorRegistry::new();
    registry.start_monitoring(ARTICLE);
    registry.update_versions(&[object("a", "1"), object("b", "2")], ARTICLE);
    registry
  }

  #[test]
  fn test_unmonitored_type_is_inert() {
    let mut registry = monitored();

    registry.update_versions(&[CacheObject::new("x", COMMENT, "1", Value::Null)], COMMENT);
    registry.add_retry_keys(&keys(&["x"]), COMMENT);
    registry.remove_versions(&keys(&["a"]), COMMENT);

    assert!(!registry.contains_type(COMMENT));
    assert!(registry.find_keys_in_monitoring(&keys(&["x"]), COMMENT).is_empty());
    assert!(registry.tracked_keys(COMMENT).is_empty());
    assert!(registry.retry_keys(COMMENT).is_empty());
    assert!(registry
      .expired_keys(&keys(&["x"]), &HashMap::new(), COMMENT)
      .is_empty());
    assert!(!registry.any_retry_pending());
    assert_eq!(registry.tracked_keys(ARTICLE), keys(&["a", "b"]));
  }

  #[test]
  fn test_start_monitoring_is_idempotent() {
    let mut registry = monitored();
    registry.start_monitoring(ARTICLE);
    assert_eq!(registry.tracked_keys(ARTICLE), keys(&["a", "b"]));
  }

  #[test]
  fn test_stop_monitoring_clears_everything() {
    let mut registry = monitored();
    registry.add_retry_keys(&keys(&["c"]), ARTICLE);

    registry.stop_monitoring(ARTICLE);
    registry.stop_monitoring(ARTICLE);

    assert!(!registry.contains_type(ARTICLE));
    assert!(!registry.has_tracked_keys());
    assert!(!registry.any_retry_pending());

    registry.start_monitoring(ARTICLE);
    assert!(registry.tracked_keys(ARTICLE).is_empty());
  }

  #[test]
  fn test_find_keys_preserves_input_order() {
    let registry = monitored();
    let found = registry.find_keys_in_monitoring(&keys(&["b", "z", "a"]), ARTICLE);
    assert_eq!(found, keys(&["b", "a"]));
  }

  #[test]
  fn test_expired_keys() {
    let registry = monitored();
    let remote: HashMap<String, String> = [
      ("a".to_string(), "1".to_string()),
      ("b".to_string(), "3".to_string()),
    ]
    .into_iter()
    .collect();

    // b changed, c is unknown locally and remotely
    let expired = registry.expired_keys(&keys(&["a", "b", "c"]), &remote, ARTICLE);
    assert_eq!(expired, keys(&["b", "c"]));

    let only_local: HashMap<String, String> = HashMap::new();
    let expired = registry.expired_keys(&keys(&["a"]), &only_local, ARTICLE);
    assert_eq!(expired, keys(&["a"]));
  }

  #[test]
  fn test_monitored_object_is_expired() {
    let registry = monitored();
    assert!(!registry.monitored_object_is_expired(&object("a", "1")));
    assert!(registry.monitored_object_is_expired(&object("a", "2")));
    assert!(registry.monitored_object_is_expired(&object("unknown", "1")));
  }

  #[test]
  fn test_remove_versions() {
    let mut registry = monitored();
    registry.remove_versions(&keys(&["a", "missing"]), ARTICLE);
    assert_eq!(registry.tracked_keys(ARTICLE), keys(&["b"]));

    registry.remove_versions(&keys(&["b"]), ARTICLE);
    assert!(!registry.has_tracked_keys());
    assert!(registry.contains_type(ARTICLE));
  }

  #[test]
  fn test_retry_queue() {
    let mut registry = monitored();
    registry.add_retry_keys(&keys(&["c", "d"]), ARTICLE);
    registry.add_retry_keys(&keys(&["c"]), ARTICLE);
    assert!(registry.any_retry_pending());
    assert_eq!(registry.retry_keys(ARTICLE), keys(&["c", "d"]));

    registry.remove_retry_keys(&keys(&["c", "d"]), ARTICLE);
    assert!(!registry.any_retry_pending());
  }
}
