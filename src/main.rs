use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use cohere::cache::{
  CoherenceController, FileStorage, MemoryCachedStorage, MemoryStorage, ObjectStorage,
  SqliteStorage, TypeToken,
};
use cohere::config::{Config, StorageBackend};
use cohere::connectivity::{Connectivity, TcpProbe};
use cohere::event::{CacheEvent, ChannelDelegate};
use cohere::remote::HttpDownloader;

#[derive(Parser, Debug)]
#[command(name = "cohere")]
#[command(about = "Keep a local object cache coherent with a remote source")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cohere/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Download keys once and print the reconciled result
  Download {
    /// Object type
    #[arg(short = 't', long = "type")]
    type_name: String,
    keys: Vec<String>,
  },
  /// Print an object, downloading it on a cache miss
  Get {
    /// Object type
    #[arg(short = 't', long = "type")]
    type_name: String,
    key: String,
  },
  /// Download keys and keep them coherent until interrupted
  Watch {
    /// Object type
    #[arg(short = 't', long = "type")]
    type_name: String,
    keys: Vec<String>,
    /// Seconds between reachability probes of the remote
    #[arg(long, default_value_t = 30)]
    probe_interval: u64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging()?;

  let storage = open_storage(&config)?;
  let downloader = Arc::new(HttpDownloader::new(&config.remote)?);

  match args.command {
    Command::Download { type_name, keys } => {
      let controller = CoherenceController::builder(config.name.clone(), storage)
        .downloader(downloader)
        .build();
      let token = TypeToken::intern(&type_name);
      monitor(&controller, &config, token)?;

      let package = controller.download(&keys, token).await?;
      println!("{}", serde_json::to_string_pretty(&package)?);
    }
    Command::Get { type_name, key } => {
      let controller = CoherenceController::builder(config.name.clone(), storage)
        .downloader(downloader)
        .build();
      let token = TypeToken::intern(&type_name);
      monitor(&controller, &config, token)?;

      match controller.get_or_download(&key, token).await? {
        Some(object) => println!("{}", serde_json::to_string_pretty(&object)?),
        None => return Err(eyre!("{} '{}' not found", token, key)),
      }
    }
    Command::Watch {
      type_name,
      keys,
      probe_interval,
    } => {
      let connectivity = Connectivity::new(true);
      let probe = TcpProbe::new(
        probe_address(&config.remote.url)?,
        Duration::from_secs(probe_interval),
      );
      let probe_handle = probe.spawn(connectivity.clone());

      let (delegate, mut events) = ChannelDelegate::new();
      let controller = CoherenceController::builder(config.name.clone(), storage)
        .downloader(downloader)
        .delegate(Arc::new(delegate))
        .connectivity(connectivity.subscribe())
        .settings(config.coherence.settings())?
        .build();
      let token = TypeToken::intern(&type_name);
      monitor(&controller, &config, token)?;

      match controller.download_or_queue(&keys, token).await {
        Ok(Some(package)) => info!(
          new = package.new_objects().len(),
          cached = package.cached().len(),
          updated = package.updated().len(),
          ignored = package.ignored().len(),
          "initial download"
        ),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "initial download failed, keys queued for retry"),
      }

      println!("Watching {} {} keys, Ctrl-C to stop", keys.len(), token);
      loop {
        tokio::select! {
          event = events.next() => match event {
            Some(CacheEvent::ObjectsUpdated { token, keys }) => {
              println!("updated {}: {}", token, keys.join(", "));
            }
            Some(CacheEvent::RetryObjectsDownloaded { token, objects }) => {
              let ids: Vec<&str> = objects.iter().map(|o| o.id()).collect();
              println!("recovered {}: {}", token, ids.join(", "));
            }
            None => break,
          },
          _ = tokio::signal::ctrl_c() => break,
        }
      }

      probe_handle.abort();
    }
  }

  Ok(())
}

/// Log to a daily rotated file under the data directory; `RUST_LOG` filters.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?.join("logs");
  let file_appender = tracing_appender::rolling::daily(log_dir, "cohere.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn open_storage(config: &Config) -> Result<Box<dyn ObjectStorage>> {
  let data_dir = Config::data_dir()?;

  let backend: Box<dyn ObjectStorage> = match config.storage.backend {
    StorageBackend::Sqlite => {
      let path = config
        .storage
        .path
        .clone()
        .unwrap_or_else(|| data_dir.join("cache.db"));
      Box::new(SqliteStorage::open(&path)?)
    }
    StorageBackend::File => {
      let root = config
        .storage
        .path
        .clone()
        .unwrap_or_else(|| data_dir.join("objects"));
      Box::new(FileStorage::new(root))
    }
    StorageBackend::Memory => Box::new(MemoryStorage::new()),
  };

  if config.storage.memory_capacity > 0 {
    Ok(Box::new(MemoryCachedStorage::new(
      backend,
      config.storage.memory_capacity,
    )))
  } else {
    Ok(backend)
  }
}

fn monitor<S: ObjectStorage + 'static>(
  controller: &CoherenceController<S>,
  config: &Config,
  token: TypeToken,
) -> Result<()> {
  for configured in &config.monitored_types {
    controller.start_monitoring(*configured)?;
  }
  controller.start_monitoring(token)
}

/// `host:port` of the remote, for reachability probing.
fn probe_address(url: &str) -> Result<String> {
  let url = Url::parse(url).map_err(|e| eyre!("Invalid remote url '{}': {}", url, e))?;
  let host = url
    .host_str()
    .ok_or_else(|| eyre!("Remote url '{}' has no host", url))?;
  let port = url
    .port_or_known_default()
    .ok_or_else(|| eyre!("Remote url '{}' has no port", url))?;

  Ok(format!("{}:{}", host, port))
}
