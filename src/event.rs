//! Delegate notifications raised by the coherence controller's loops.

use tokio::sync::mpsc;

use crate::cache::{CacheObject, TypeToken};

/// Observer of changes made by the coherence controller.
///
/// Calls are fire-and-forget: implementations must return promptly and never
/// block the controller.
pub trait CoherenceDelegate: Send + Sync {
  /// Objects for `keys` were refreshed from the remote by the refresh loop.
  fn on_objects_updated(&self, keys: Vec<String>, token: TypeToken);

  /// The retry loop downloaded `objects` that previously failed.
  fn on_retry_objects_downloaded(&self, objects: Vec<CacheObject>, token: TypeToken);
}

/// Cache events
#[derive(Debug, Clone)]
pub enum CacheEvent {
  /// Keys refreshed after a version checkout
  ObjectsUpdated { token: TypeToken, keys: Vec<String> },
  /// Objects recovered by the retry loop
  RetryObjectsDownloaded {
    token: TypeToken,
    objects: Vec<CacheObject>,
  },
}

/// Delegate that forwards every notification as a [`CacheEvent`] on a channel.
#[derive(Clone)]
pub struct ChannelDelegate {
  tx: mpsc::UnboundedSender<CacheEvent>,
}

impl ChannelDelegate {
  /// Create a delegate together with the receiver for its events
  pub fn new() -> (Self, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, EventReceiver { rx })
  }

  fn send(&self, event: CacheEvent) {
    // A dropped receiver just means nobody is listening any more
    if self.tx.send(event).is_err() {
      tracing::trace!("cache event dropped, receiver closed");
    }
  }
}

impl CoherenceDelegate for ChannelDelegate {
  fn on_objects_updated(&self, keys: Vec<String>, token: TypeToken) {
    self.send(CacheEvent::ObjectsUpdated { token, keys });
  }

  fn on_retry_objects_downloaded(&self, objects: Vec<CacheObject>, token: TypeToken) {
    self.send(CacheEvent::RetryObjectsDownloaded { token, objects });
  }
}

/// Receiving end of a [`ChannelDelegate`]
pub struct EventReceiver {
  rx: mpsc::UnboundedReceiver<CacheEvent>,
}

impl EventReceiver {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<CacheEvent> {
    self.rx.recv().await
  }

  /// Take an event if one is already queued
  pub fn try_next(&mut self) -> Option<CacheEvent> {
    self.rx.try_recv().ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Value;

  const ARTICLE: TypeToken = TypeToken::new("article");

  #[tokio::test]
  async fn test_events_are_forwarded_in_order() {
    let (delegate, mut events) = ChannelDelegate::new();

    delegate.on_objects_updated(vec!["a".to_string()], ARTICLE);
    delegate.on_retry_objects_downloaded(
      vec![CacheObject::new("b", ARTICLE, "1", Value::Null)],
      ARTICLE,
    );

    match events.next().await {
      Some(CacheEvent::ObjectsUpdated { token, keys }) => {
        assert_eq!(token, ARTICLE);
        assert_eq!(keys, vec!["a"]);
      }
      other => panic!("Expected ObjectsUpdated, got {other:?}"),
    }
    match events.next().await {
      Some(CacheEvent::RetryObjectsDownloaded { objects, .. }) => {
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id(), "b");
      }
      other => panic!("Expected RetryObjectsDownloaded, got {other:?}"),
    }
    assert!(events.try_next().is_none());
  }

  #[test]
  fn test_send_after_receiver_dropped_is_harmless() {
    let (delegate, events) = ChannelDelegate::new();
    drop(events);
    delegate.on_objects_updated(vec!["a".to_string()], ARTICLE);
  }
}
