//! Remote downloader seams.

use async_trait::async_trait;
use color_eyre::Result;

use super::object::{CacheObject, TypeToken, VersionPackage};

/// Fetches objects from the remote source.
#[async_trait]
pub trait Downloader: Send + Sync {
  /// Download the objects for `keys`. Keys the remote knows nothing about are
  /// simply absent from the result.
  async fn download_objects(&self, keys: &[String], token: TypeToken) -> Result<Vec<CacheObject>>;

  /// Version checkout capability, if this downloader has one.
  ///
  /// Queried once when a controller is built.
  fn version_checkout(&self) -> Option<&dyn VersionCheckout> {
    None
  }
}

/// Capability to ask the remote for current versions without full payloads.
#[async_trait]
pub trait VersionCheckout: Send + Sync {
  async fn checkout_version(&self, keys: &[String], token: TypeToken) -> Result<VersionPackage>;
}
