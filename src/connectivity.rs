//! Push-based reachability signal.
//!
//! Observers hold a `watch::Receiver<bool>` and only wake on transitions.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Owner of the reachability flag.
#[derive(Clone)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(reachable: bool) -> Self {
    let (tx, _rx) = watch::channel(reachable);
    Self { tx }
  }

  /// Subscribe to reachability transitions.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  pub fn is_reachable(&self) -> bool {
    *self.tx.borrow()
  }

  /// Publish the current reachability. Subscribers are only notified when
  /// the value actually changes.
  pub fn set_reachable(&self, reachable: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == reachable {
        return false;
      }
      *current = reachable;
      true
    });

    if changed {
      info!(reachable, "connectivity changed");
    }
  }
}

/// Periodically opens a TCP connection to decide reachability of a remote.
pub struct TcpProbe {
  address: String,
  interval: Duration,
  timeout: Duration,
}

impl TcpProbe {
  pub fn new(address: impl Into<String>, interval: Duration) -> Self {
    Self {
      address: address.into(),
      interval,
      timeout: Duration::from_secs(5),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Probe once.
  pub async fn probe(&self) -> bool {
    match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
      Ok(Ok(_)) => true,
      Ok(Err(e)) => {
        debug!(address = %self.address, error = %e, "probe failed");
        false
      }
      Err(_) => {
        debug!(address = %self.address, "probe timed out");
        false
      }
    }
  }

  /// Run the probe forever, feeding `connectivity`.
  pub fn spawn(self, connectivity: Connectivity) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.interval);
      loop {
        interval.tick().await;
        connectivity.set_reachable(self.probe().await);
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_only_transitions_notify() {
    let connectivity = Connectivity::new(true);
    let mut rx = connectivity.subscribe();

    connectivity.set_reachable(true);
    assert!(!rx.has_changed().unwrap());

    connectivity.set_reachable(false);
    assert!(rx.has_changed().unwrap());
    assert!(!*rx.borrow_and_update());
    assert!(!connectivity.is_reachable());
  }

  #[tokio::test]
  async fn test_probe_detects_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let probe = TcpProbe::new(address.clone(), Duration::from_secs(1));
    assert!(probe.probe().await);

    drop(listener);
    let probe =
      TcpProbe::new(address, Duration::from_secs(1)).with_timeout(Duration::from_millis(500));
    assert!(!probe.probe().await);
  }
}
