use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CoherenceSettings, TypeToken};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Name of the cache, used in logs
  #[serde(default = "default_name")]
  pub name: String,
  pub remote: RemoteConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub coherence: CoherenceConfig,
  /// Types to monitor for version changes
  #[serde(default)]
  pub monitored_types: Vec<TypeToken>,
}

fn default_name() -> String {
  "cohere".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base url of the object API (e.g. "https://objects.example.com/api")
  pub url: String,
  #[serde(default = "default_timeout")]
  pub timeout_seconds: u64,
  /// Whether the remote serves the `versions` endpoint
  #[serde(default = "default_true")]
  pub version_checkout: bool,
}

fn default_timeout() -> u64 {
  30
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Single SQLite database
  #[default]
  Sqlite,
  /// One JSON file per object
  File,
  /// Process memory only
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackend,
  /// Database file or root directory (defaults under the data directory)
  pub path: Option<PathBuf>,
  /// Number of objects kept in the memory cache in front of the backend (0 disables it)
  #[serde(default)]
  pub memory_capacity: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct CoherenceConfig {
  #[serde(default)]
  pub version_checkout_enabled: bool,
  #[serde(default = "default_refresh_interval")]
  pub refresh_interval_seconds: u64,
  #[serde(default)]
  pub retry_enabled: bool,
  #[serde(default = "default_retry_interval")]
  pub retry_interval_seconds: u64,
}

fn default_refresh_interval() -> u64 {
  300
}

fn default_retry_interval() -> u64 {
  60
}

impl Default for CoherenceConfig {
  fn default() -> Self {
    Self {
      version_checkout_enabled: false,
      refresh_interval_seconds: default_refresh_interval(),
      retry_enabled: false,
      retry_interval_seconds: default_retry_interval(),
    }
  }
}

impl CoherenceConfig {
  pub fn settings(&self) -> CoherenceSettings {
    CoherenceSettings {
      version_checkout_enabled: self.version_checkout_enabled,
      refresh_interval: Duration::from_secs(self.refresh_interval_seconds),
      retry_enabled: self.retry_enabled,
      retry_interval: Duration::from_secs(self.retry_interval_seconds),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cohere.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cohere/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/cohere/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cohere.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cohere").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if config.coherence.refresh_interval_seconds == 0 {
      return Err(eyre!("coherence.refresh_interval_seconds must be greater than zero"));
    }
    if config.coherence.retry_interval_seconds == 0 {
      return Err(eyre!("coherence.retry_interval_seconds must be greater than zero"));
    }

    Ok(config)
  }

  /// Directory for cache data and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cohere"))
  }

  /// Get the remote API token from environment variables, if any.
  ///
  /// Checks COHERE_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("COHERE_API_TOKEN").ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("remote:\n  url: http://localhost:8080/api\n").unwrap();

    assert_eq!(config.name, "cohere");
    assert_eq!(config.remote.timeout_seconds, 30);
    assert!(config.remote.version_checkout);
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.storage.memory_capacity, 0);
    assert_eq!(config.coherence, CoherenceConfig::default());
    assert!(config.monitored_types.is_empty());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
name: articles
remote:
  url: https://objects.example.com/api
  timeout_seconds: 5
  version_checkout: false
storage:
  backend: file
  path: /tmp/cohere
  memory_capacity: 500
coherence:
  version_checkout_enabled: true
  refresh_interval_seconds: 120
  retry_enabled: true
  retry_interval_seconds: 15
monitored_types: [article, comment]
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.name, "articles");
    assert!(!config.remote.version_checkout);
    assert_eq!(config.storage.backend, StorageBackend::File);
    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/cohere")));
    assert_eq!(
      config.monitored_types,
      vec![TypeToken::new("article"), TypeToken::new("comment")]
    );

    let settings = config.coherence.settings();
    assert!(settings.version_checkout_enabled);
    assert_eq!(settings.refresh_interval, Duration::from_secs(120));
    assert!(settings.retry_enabled);
    assert_eq!(settings.retry_interval, Duration::from_secs(15));
  }

  #[test]
  fn test_zero_interval_is_rejected() {
    let yaml = "remote:\n  url: http://localhost\ncoherence:\n  retry_interval_seconds: 0\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }
}
