//! Coherence controller: keeps the monitor registry in sync with storage,
//! reconciles downloads and drives the refresh and retry loops.

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::downloader::{Downloader, VersionCheckout};
use super::object::{CacheObject, DownloadPackage, TypeToken};
use super::registry::MonitorRegistry;
use super::storage::ObjectStorage;
use crate::event::CoherenceDelegate;

/// Loop flags and periods for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherenceSettings {
  pub version_checkout_enabled: bool,
  pub refresh_interval: Duration,
  pub retry_enabled: bool,
  pub retry_interval: Duration,
}

impl Default for CoherenceSettings {
  fn default() -> Self {
    Self {
      version_checkout_enabled: false,
      refresh_interval: Duration::from_secs(300),
      retry_enabled: false,
      retry_interval: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
  Refresh,
  Retry,
}

/// One periodic loop. At most one live timer handle exists per loop.
struct LoopState {
  enabled: bool,
  interval: Duration,
  handle: Option<JoinHandle<()>>,
}

impl LoopState {
  fn new(enabled: bool, interval: Duration) -> Self {
    Self {
      enabled,
      interval,
      handle: None,
    }
  }

  fn is_armed(&self) -> bool {
    self.handle.as_ref().is_some_and(|h| !h.is_finished())
  }

  fn cancel(&mut self) -> bool {
    match self.handle.take() {
      Some(handle) => {
        handle.abort();
        true
      }
      None => false,
    }
  }
}

/// How a downloaded object relates to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
  New,
  Cached,
  Updated,
}

/// Downloaded objects split by freshness.
#[derive(Default)]
struct Classified {
  new: Vec<CacheObject>,
  cached: Vec<CacheObject>,
  updated: Vec<CacheObject>,
}

impl Classified {
  fn push(&mut self, freshness: Freshness, object: CacheObject) {
    match freshness {
      Freshness::New => self.new.push(object),
      Freshness::Cached => self.cached.push(object),
      Freshness::Updated => self.updated.push(object),
    }
  }
}

struct Inner<S: ObjectStorage> {
  name: String,
  storage: S,
  downloader: Option<Arc<dyn Downloader>>,
  /// Whether the downloader exposes version checkout; decided at build time
  version_capable: bool,
  delegate: Option<Arc<dyn CoherenceDelegate>>,
  registry: Mutex<MonitorRegistry>,
  refresh: Mutex<LoopState>,
  retry: Mutex<LoopState>,
  reachable: watch::Receiver<bool>,
  listener: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`CoherenceController`].
pub struct ControllerBuilder<S: ObjectStorage> {
  name: String,
  storage: S,
  downloader: Option<Arc<dyn Downloader>>,
  delegate: Option<Arc<dyn CoherenceDelegate>>,
  connectivity: Option<watch::Receiver<bool>>,
  settings: CoherenceSettings,
}

impl<S: ObjectStorage + 'static> ControllerBuilder<S> {
  pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
    self.downloader = Some(downloader);
    self
  }

  pub fn delegate(mut self, delegate: Arc<dyn CoherenceDelegate>) -> Self {
    self.delegate = Some(delegate);
    self
  }

  /// Subscribe to a reachability signal. Without one the remote is always
  /// considered reachable.
  pub fn connectivity(mut self, reachable: watch::Receiver<bool>) -> Self {
    self.connectivity = Some(reachable);
    self
  }

  pub fn settings(mut self, settings: CoherenceSettings) -> Result<Self> {
    validate_interval(settings.refresh_interval)?;
    validate_interval(settings.retry_interval)?;
    self.settings = settings;
    Ok(self)
  }

  /// Build the controller and start listening for connectivity changes.
  ///
  /// Must be called from within a tokio runtime.
  pub fn build(self) -> CoherenceController<S> {
    let reachable = self.connectivity.unwrap_or_else(|| watch::channel(true).1);
    let version_capable = self
      .downloader
      .as_ref()
      .is_some_and(|d| d.version_checkout().is_some());

    let inner = Arc::new(Inner {
      name: self.name,
      storage: self.storage,
      downloader: self.downloader,
      version_capable,
      delegate: self.delegate,
      registry: Mutex::new(MonitorRegistry::new()),
      refresh: Mutex::new(LoopState::new(
        self.settings.version_checkout_enabled,
        self.settings.refresh_interval,
      )),
      retry: Mutex::new(LoopState::new(
        self.settings.retry_enabled,
        self.settings.retry_interval,
      )),
      reachable: reachable.clone(),
      listener: Mutex::new(None),
    });

    let listener = spawn_connectivity_listener(Arc::downgrade(&inner), reachable);
    *inner.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);

    info!(
      cache = %inner.name,
      downloader = inner.downloader.is_some(),
      version_checkout = version_capable,
      "coherence controller ready"
    );

    CoherenceController { inner }
  }
}

/// Versioned cache over a storage backend.
///
/// Tracks versions of objects of monitored types, reconciles downloads into
/// new/cached/updated/ignored, periodically re-validates tracked objects and
/// retries failed downloads while the remote is reachable.
pub struct CoherenceController<S: ObjectStorage> {
  inner: Arc<Inner<S>>,
}

impl<S: ObjectStorage + 'static> CoherenceController<S> {
  pub fn builder(name: impl Into<String>, storage: S) -> ControllerBuilder<S> {
    ControllerBuilder {
      name: name.into(),
      storage,
      downloader: None,
      delegate: None,
      connectivity: None,
      settings: CoherenceSettings::default(),
    }
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn storage(&self) -> &S {
    &self.inner.storage
  }

  // ---------------------------------------------------------------------------
  // Monitoring
  // ---------------------------------------------------------------------------

  /// Start tracking versions for `token`. Idempotent.
  pub fn start_monitoring(&self, token: TypeToken) -> Result<()> {
    self.inner.registry()?.start_monitoring(token);
    debug!(cache = %self.inner.name, %token, "monitoring started");
    Ok(())
  }

  /// Stop tracking `token`, dropping its versions and retry keys. Idempotent.
  pub fn stop_monitoring(&self, token: TypeToken) -> Result<()> {
    self.inner.registry()?.stop_monitoring(token);
    debug!(cache = %self.inner.name, %token, "monitoring stopped");
    self.inner.evaluate(LoopKind::Refresh);
    self.inner.evaluate(LoopKind::Retry);
    Ok(())
  }

  pub fn is_monitoring(&self, token: TypeToken) -> Result<bool> {
    Ok(self.inner.registry()?.contains_type(token))
  }

  /// Keys currently tracked for `token`.
  pub fn monitored_keys(&self, token: TypeToken) -> Result<Vec<String>> {
    Ok(self.inner.registry()?.tracked_keys(token))
  }

  /// The tracked subset of `keys`, in input order.
  pub fn find_keys_in_monitoring(&self, keys: &[String], token: TypeToken) -> Result<Vec<String>> {
    Ok(self.inner.registry()?.find_keys_in_monitoring(keys, token))
  }

  pub fn pending_retry_keys(&self, token: TypeToken) -> Result<Vec<String>> {
    Ok(self.inner.registry()?.retry_keys(token))
  }

  // ---------------------------------------------------------------------------
  // Loop configuration
  // ---------------------------------------------------------------------------

  pub fn set_version_checkout_enabled(&self, enabled: bool) {
    self.inner.set_enabled(LoopKind::Refresh, enabled);
  }

  pub fn set_refresh_interval(&self, interval: Duration) -> Result<()> {
    self.inner.set_interval(LoopKind::Refresh, interval)
  }

  pub fn set_retry_enabled(&self, enabled: bool) {
    self.inner.set_enabled(LoopKind::Retry, enabled);
  }

  pub fn set_retry_interval(&self, interval: Duration) -> Result<()> {
    self.inner.set_interval(LoopKind::Retry, interval)
  }

  pub fn refresh_running(&self) -> bool {
    self.inner.loop_state(LoopKind::Refresh).is_armed()
  }

  pub fn retry_running(&self) -> bool {
    self.inner.loop_state(LoopKind::Retry).is_armed()
  }

  pub fn is_reachable(&self) -> bool {
    self.inner.is_reachable()
  }

  // ---------------------------------------------------------------------------
  // Storage pass-through
  // ---------------------------------------------------------------------------

  /// Store an object; for a monitored type its version becomes the tracked one.
  pub async fn store(&self, object: &CacheObject) -> Result<()> {
    self.inner.persist(object).await?;
    self.inner.evaluate(LoopKind::Refresh);
    Ok(())
  }

  pub async fn store_many(&self, objects: &[CacheObject]) -> Result<()> {
    for object in objects {
      self.inner.persist(object).await?;
    }
    self.inner.evaluate(LoopKind::Refresh);
    Ok(())
  }

  /// Read an object from storage. A found object of a monitored type is
  /// synced into the registry.
  pub async fn get(&self, key: &str, token: TypeToken) -> Result<Option<CacheObject>> {
    let object = self.inner.storage.get(key, token).await?;
    if let Some(object) = &object {
      self.inner.sync_versions(std::slice::from_ref(object), token)?;
    }
    Ok(object)
  }

  pub async fn get_many(&self, keys: &[String], token: TypeToken) -> Result<Vec<CacheObject>> {
    let objects = self.inner.storage.get_many(keys, token).await?;
    self.inner.sync_versions(&objects, token)?;
    Ok(objects)
  }

  pub async fn exists(&self, key: &str, token: TypeToken) -> Result<bool> {
    self.inner.storage.exists(key, token).await
  }

  /// Cache-first read: serve from storage, download on a miss.
  ///
  /// Returns `None` when the object is neither stored nor obtainable (no
  /// downloader, or the remote ignored the key).
  pub async fn get_or_download(&self, key: &str, token: TypeToken) -> Result<Option<CacheObject>> {
    if let Some(object) = self.get(key, token).await? {
      return Ok(Some(object));
    }

    let package = self.inner.download(&[key.to_string()], token).await?;
    Ok(package.and_then(|p| p.find(key).cloned()))
  }

  pub async fn remove(&self, key: &str, token: TypeToken) -> Result<()> {
    self.remove_many(&[key.to_string()], token).await
  }

  pub async fn remove_many(&self, keys: &[String], token: TypeToken) -> Result<()> {
    self.inner.purge(keys, token).await?;
    self.inner.evaluate(LoopKind::Refresh);
    Ok(())
  }

  // ---------------------------------------------------------------------------
  // Downloads
  // ---------------------------------------------------------------------------

  /// Download `keys` and reconcile the response against local state.
  ///
  /// Returns `Ok(None)` when there is nothing to reconcile (no downloader or
  /// no keys). A downloader error, or an empty response, fails the call.
  pub async fn download(
    &self,
    keys: &[String],
    token: TypeToken,
  ) -> Result<Option<DownloadPackage>> {
    self.inner.download(keys, token).await
  }

  /// Like [`download`](Self::download), but on failure the keys are queued
  /// for the retry loop before the error is returned.
  pub async fn download_or_queue(
    &self,
    keys: &[String],
    token: TypeToken,
  ) -> Result<Option<DownloadPackage>> {
    self.inner.download_or_queue(keys, token).await
  }

  /// Queue keys for the retry loop. No-op for unmonitored types.
  pub fn queue_retry(&self, keys: &[String], token: TypeToken) -> Result<()> {
    self.inner.registry()?.add_retry_keys(keys, token);
    self.inner.evaluate(LoopKind::Retry);
    Ok(())
  }

  /// Drop keys from the retry queue.
  pub fn cancel_retry(&self, keys: &[String], token: TypeToken) -> Result<()> {
    self.inner.registry()?.remove_retry_keys(keys, token);
    self.inner.evaluate(LoopKind::Retry);
    Ok(())
  }
}

impl<S: ObjectStorage> Clone for CoherenceController<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: ObjectStorage + 'static> Inner<S> {
  fn registry(&self) -> Result<MutexGuard<'_, MonitorRegistry>> {
    self
      .registry
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn loop_state(&self, kind: LoopKind) -> MutexGuard<'_, LoopState> {
    let state = match kind {
      LoopKind::Refresh => &self.refresh,
      LoopKind::Retry => &self.retry,
    };
    state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn is_reachable(&self) -> bool {
    *self.reachable.borrow()
  }

  /// Write an object to storage, then record its version. The registry is
  /// only touched once the write succeeded.
  async fn persist(&self, object: &CacheObject) -> Result<()> {
    self.storage.put(object).await?;
    self
      .registry()?
      .update_versions(std::iter::once(object), object.token());
    Ok(())
  }

  /// Remove keys from storage, then from the registry.
  async fn purge(&self, keys: &[String], token: TypeToken) -> Result<()> {
    self.storage.remove_many(keys, token).await?;
    self.registry()?.remove_versions(keys, token);
    Ok(())
  }

  fn sync_versions(self: &Arc<Self>, objects: &[CacheObject], token: TypeToken) -> Result<()> {
    if objects.is_empty() {
      return Ok(());
    }
    self.registry()?.update_versions(objects, token);
    self.evaluate(LoopKind::Refresh);
    Ok(())
  }

  fn set_enabled(self: &Arc<Self>, kind: LoopKind, enabled: bool) {
    {
      let mut state = self.loop_state(kind);
      if state.enabled == enabled {
        return;
      }
      state.enabled = enabled;
    }
    debug!(cache = %self.name, ?kind, enabled, "loop flag changed");
    self.evaluate(kind);
  }

  fn set_interval(self: &Arc<Self>, kind: LoopKind, interval: Duration) -> Result<()> {
    validate_interval(interval)?;
    {
      let mut state = self.loop_state(kind);
      if state.interval == interval {
        return Ok(());
      }
      state.interval = interval;
      // Re-armed below with the new period
      state.cancel();
    }
    debug!(cache = %self.name, ?kind, ?interval, "loop interval changed");
    self.evaluate(kind);
    Ok(())
  }

  /// Whether a loop's queue has work: tracked keys for refresh, pending
  /// retry keys for retry.
  fn has_work(&self, kind: LoopKind) -> bool {
    match self.registry() {
      Ok(registry) => match kind {
        LoopKind::Refresh => registry.has_tracked_keys(),
        LoopKind::Retry => registry.any_retry_pending(),
      },
      Err(e) => {
        warn!(cache = %self.name, error = %e, "registry unavailable");
        false
      }
    }
  }

  /// Arm or cancel a loop's timer so that it runs iff the flag is enabled,
  /// the downloader supports the loop, there is work queued and the remote
  /// is reachable.
  fn evaluate(self: &Arc<Self>, kind: LoopKind) {
    let capable = match kind {
      LoopKind::Refresh => self.version_capable,
      LoopKind::Retry => self.downloader.is_some(),
    };
    let has_work = self.has_work(kind);
    let reachable = self.is_reachable();

    let mut state = self.loop_state(kind);
    let should_run = state.enabled && capable && has_work && reachable;

    if should_run {
      if !state.is_armed() {
        state.handle = Some(spawn_timer(Arc::downgrade(self), kind, state.interval));
        debug!(cache = %self.name, ?kind, interval = ?state.interval, "loop armed");
      }
    } else if state.cancel() {
      debug!(cache = %self.name, ?kind, "loop stopped");
    }
  }

  fn on_connectivity_changed(self: &Arc<Self>, reachable: bool) {
    if reachable {
      info!(cache = %self.name, "remote reachable, resuming loops");
      self.evaluate(LoopKind::Refresh);
      self.evaluate(LoopKind::Retry);
    } else {
      info!(cache = %self.name, "remote unreachable, pausing loops");
      self.loop_state(LoopKind::Refresh).cancel();
      self.loop_state(LoopKind::Retry).cancel();
    }
  }

  // ---------------------------------------------------------------------------
  // Reconciliation
  // ---------------------------------------------------------------------------

  async fn download(
    self: &Arc<Self>,
    keys: &[String],
    token: TypeToken,
  ) -> Result<Option<DownloadPackage>> {
    let Some(downloader) = self.downloader.clone() else {
      return Ok(None);
    };
    if keys.is_empty() {
      return Ok(None);
    }

    let objects = downloader
      .download_objects(keys, token)
      .await
      .wrap_err_with(|| format!("Failed to download {} {} objects", keys.len(), token))?;

    if objects.is_empty() {
      return Err(eyre!(
        "Downloader returned nothing for {} {} keys",
        keys.len(),
        token
      ));
    }

    let classified = self.classify(keys, objects).await;
    // Anything already persisted stays tracked even if classification failed midway
    self.evaluate(LoopKind::Refresh);
    let classified = classified?;

    let returned: HashSet<&str> = classified
      .new
      .iter()
      .chain(&classified.cached)
      .chain(&classified.updated)
      .map(|o| o.id())
      .collect();
    let ignored: Vec<String> = keys
      .iter()
      .filter(|k| !returned.contains(k.as_str()))
      .cloned()
      .collect();

    debug!(
      cache = %self.name,
      %token,
      new = classified.new.len(),
      cached = classified.cached.len(),
      updated = classified.updated.len(),
      ignored = ignored.len(),
      "download reconciled"
    );

    Ok(Some(DownloadPackage::new(
      keys.to_vec(),
      classified.new,
      classified.cached,
      classified.updated,
      ignored,
    )))
  }

  /// Classify every returned object, persisting new and updated ones as it goes.
  ///
  /// Ignored objects, objects for keys that were not requested and repeated
  /// ids are skipped.
  async fn classify(&self, keys: &[String], objects: Vec<CacheObject>) -> Result<Classified> {
    let requested: HashSet<&str> = keys.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut classified = Classified::default();

    for object in objects {
      if object.is_ignored() || !requested.contains(object.id()) {
        continue;
      }
      if !seen.insert(object.id().to_string()) {
        continue;
      }

      let freshness = self.freshness(&object).await?;
      if freshness != Freshness::Cached {
        self.persist(&object).await?;
      }
      classified.push(freshness, object);
    }

    Ok(classified)
  }

  async fn freshness(&self, object: &CacheObject) -> Result<Freshness> {
    if !self.storage.exists(object.id(), object.token()).await? {
      return Ok(Freshness::New);
    }

    if self.registry()?.monitored_object_is_expired(object) {
      Ok(Freshness::Updated)
    } else {
      Ok(Freshness::Cached)
    }
  }

  async fn download_or_queue(
    self: &Arc<Self>,
    keys: &[String],
    token: TypeToken,
  ) -> Result<Option<DownloadPackage>> {
    match self.download(keys, token).await {
      Ok(package) => Ok(package),
      Err(e) => {
        warn!(
          cache = %self.name,
          %token,
          keys = keys.len(),
          error = %e,
          "download failed, queued for retry"
        );
        self.registry()?.add_retry_keys(keys, token);
        self.evaluate(LoopKind::Retry);
        Err(e)
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Loop bodies
  // ---------------------------------------------------------------------------

  async fn refresh_tick(self: &Arc<Self>) {
    let Some(downloader) = self.downloader.clone() else {
      return;
    };
    let Some(checkout) = downloader.version_checkout() else {
      return;
    };

    let tokens = match self.registry() {
      Ok(registry) => registry.monitored_types(),
      Err(e) => {
        warn!(cache = %self.name, error = %e, "refresh skipped");
        return;
      }
    };

    for token in tokens {
      if let Err(e) = self.refresh_type(checkout, token).await {
        warn!(cache = %self.name, %token, error = %e, "version refresh failed");
      }
    }
  }

  async fn refresh_type(
    self: &Arc<Self>,
    checkout: &dyn VersionCheckout,
    token: TypeToken,
  ) -> Result<()> {
    let keys = self.registry()?.tracked_keys(token);
    if keys.is_empty() {
      return Ok(());
    }

    let package = checkout
      .checkout_version(&keys, token)
      .await
      .wrap_err_with(|| format!("Failed to check out {} {} versions", keys.len(), token))?;

    let candidates: Vec<String> = keys
      .into_iter()
      .filter(|k| !package.ignored().contains(k))
      .collect();
    let expired = self
      .registry()?
      .expired_keys(&candidates, package.versions(), token);

    if expired.is_empty() {
      debug!(cache = %self.name, %token, checked = candidates.len(), "all versions current");
      return Ok(());
    }

    info!(cache = %self.name, %token, expired = expired.len(), "refreshing expired objects");
    self.purge(&expired, token).await?;

    let mut updated_keys = Vec::new();
    let mut missing = expired;
    if let Some(objects) = package.into_objects() {
      for object in objects.into_iter().filter(|o| !o.is_ignored()) {
        let Some(pos) = missing.iter().position(|k| k == object.id()) else {
          continue;
        };
        self.persist(&object).await?;
        missing.remove(pos);
        updated_keys.push(object.id().to_string());
      }
    }

    // Expired keys were purged; a failed download hands them to the retry loop
    if !missing.is_empty() {
      match self.download_or_queue(&missing, token).await {
        Ok(Some(package)) => updated_keys.extend(package.non_ignored_keys()),
        Ok(None) => {}
        Err(_) => {
          debug!(cache = %self.name, %token, queued = missing.len(), "re-download deferred")
        }
      }
    }

    if !updated_keys.is_empty() {
      if let Some(delegate) = &self.delegate {
        delegate.on_objects_updated(updated_keys, token);
      }
    }

    Ok(())
  }

  async fn retry_tick(self: &Arc<Self>) {
    let Some(downloader) = self.downloader.clone() else {
      return;
    };

    let tokens = match self.registry() {
      Ok(registry) => registry.monitored_types(),
      Err(e) => {
        warn!(cache = %self.name, error = %e, "retry skipped");
        return;
      }
    };

    for token in tokens {
      let keys = match self.registry() {
        Ok(registry) => registry.retry_keys(token),
        Err(_) => continue,
      };
      if keys.is_empty() {
        continue;
      }

      match downloader.download_objects(&keys, token).await {
        Ok(objects) if !objects.is_empty() => {
          if let Err(e) = self.apply_retry(&keys, objects, token).await {
            warn!(
              cache = %self.name,
              %token,
              error = %e,
              "failed to store retried objects, keys stay queued"
            );
          }
        }
        Ok(_) => {
          debug!(
            cache = %self.name,
            %token,
            keys = keys.len(),
            "retry returned nothing, keeping keys queued"
          );
        }
        Err(e) => {
          warn!(cache = %self.name, %token, keys = keys.len(), error = %e, "retry download failed");
        }
      }
    }
  }

  /// Store retried objects, then settle the queue. Keys stay queued unless
  /// every write succeeded.
  async fn apply_retry(
    self: &Arc<Self>,
    keys: &[String],
    objects: Vec<CacheObject>,
    token: TypeToken,
  ) -> Result<()> {
    let settled = self.settle_retry(keys, &objects, token).await;
    // Stored objects are tracked now, even if a later write failed
    self.evaluate(LoopKind::Refresh);
    settled?;

    info!(cache = %self.name, %token, downloaded = objects.len(), "retry succeeded");
    if let Some(delegate) = &self.delegate {
      delegate.on_retry_objects_downloaded(objects, token);
    }
    Ok(())
  }

  async fn settle_retry(
    &self,
    keys: &[String],
    objects: &[CacheObject],
    token: TypeToken,
  ) -> Result<()> {
    for object in objects {
      self.persist(object).await?;
    }

    let returned: HashSet<&str> = objects.iter().map(|o| o.id()).collect();
    let absent: Vec<String> = keys
      .iter()
      .filter(|k| !returned.contains(k.as_str()))
      .cloned()
      .collect();
    self.purge(&absent, token).await?;
    self.registry()?.remove_retry_keys(keys, token);
    Ok(())
  }
}

impl<S: ObjectStorage> Drop for Inner<S> {
  fn drop(&mut self) {
    for state in [&self.refresh, &self.retry] {
      if let Some(handle) = state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .handle
        .take()
      {
        handle.abort();
      }
    }
    if let Some(listener) = self
      .listener
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      listener.abort();
    }
  }
}

fn validate_interval(interval: Duration) -> Result<()> {
  if interval.is_zero() {
    return Err(eyre!("Loop interval must be greater than zero"));
  }
  Ok(())
}

/// Spawn a periodic loop. The task holds only a weak reference and ends once
/// the controller is gone.
fn spawn_timer<S: ObjectStorage + 'static>(
  inner: Weak<Inner<S>>,
  kind: LoopKind,
  period: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let Some(inner) = inner.upgrade() else {
        break;
      };

      // Connectivity may have dropped since the timer was armed
      if !inner.is_reachable() {
        debug!(cache = %inner.name, ?kind, "tick skipped, remote unreachable");
        continue;
      }

      match kind {
        LoopKind::Refresh => inner.refresh_tick().await,
        LoopKind::Retry => inner.retry_tick().await,
      }
      inner.evaluate(kind);
    }
  })
}

fn spawn_connectivity_listener<S: ObjectStorage + 'static>(
  inner: Weak<Inner<S>>,
  mut reachable: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    while reachable.changed().await.is_ok() {
      let is_reachable = *reachable.borrow_and_update();
      let Some(inner) = inner.upgrade() else {
        break;
      };
      inner.on_connectivity_changed(is_reachable);
    }
  })
}
