//! Versioned cache-coherence engine.
//!
//! This module tracks which cached objects must be re-validated against a
//! remote source:
//! - Keeps per-type version maps for monitored types
//! - Reconciles downloads into new, cached, updated and ignored objects
//! - Periodically checks out remote versions and refreshes expired objects
//! - Retries failed downloads while the remote is reachable

mod controller;
mod downloader;
mod file_storage;
mod memory;
mod object;
mod registry;
mod storage;

pub use controller::{CoherenceController, CoherenceSettings, ControllerBuilder};
pub use downloader::{Downloader, VersionCheckout};
pub use file_storage::FileStorage;
pub use memory::MemoryCachedStorage;
pub use object::{CacheObject, Cacheable, DownloadPackage, ObjectRecord, TypeToken, VersionPackage};
pub use registry::MonitorRegistry;
pub use storage::{MemoryStorage, ObjectStorage, SqliteStorage};
