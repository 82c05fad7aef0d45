use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{CacheObject, Downloader, TypeToken, VersionCheckout, VersionPackage};
use crate::config::{Config, RemoteConfig};
use crate::remote::api_types::{ApiKeysRequest, ApiObjectsResponse, ApiVersionsResponse};

/// Downloader talking to a JSON object API.
///
/// For a token `article` it calls `POST {base}/article/objects` and, when
/// version checkout is enabled, `POST {base}/article/versions`.
#[derive(Clone)]
pub struct HttpDownloader {
  client: reqwest::Client,
  base_url: Url,
  api_token: Option<String>,
  version_checkout: bool,
}

impl HttpDownloader {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote url '{}': {}", config.url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Remote url '{}' cannot be used as a base", config.url));
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_seconds))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      api_token: Config::get_api_token(),
      version_checkout: config.version_checkout,
    })
  }

  /// Endpoint for `token` and `action`, e.g. `{base}/article/objects`.
  fn endpoint(&self, token: TypeToken, action: &str) -> Result<Url> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("Remote url cannot be used as a base"))?
      .pop_if_empty()
      .push(token.name())
      .push(action);
    Ok(url)
  }

  async fn post_keys<R: DeserializeOwned>(&self, url: Url, keys: &[String]) -> Result<R> {
    let mut request = self.client.post(url.clone()).json(&ApiKeysRequest { keys });
    if let Some(api_token) = &self.api_token {
      request = request.bearer_auth(api_token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach {}: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("{} responded with {}", url, status));
    }

    response
      .json::<R>()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }
}

#[async_trait]
impl Downloader for HttpDownloader {
  async fn download_objects(&self, keys: &[String], token: TypeToken) -> Result<Vec<CacheObject>> {
    let url = self.endpoint(token, "objects")?;
    let response: ApiObjectsResponse = self.post_keys(url, keys).await?;

    debug!(%token, requested = keys.len(), received = response.objects.len(), "downloaded objects");

    Ok(
      response
        .objects
        .into_iter()
        .map(|o| o.into_object(token))
        .collect(),
    )
  }

  fn version_checkout(&self) -> Option<&dyn VersionCheckout> {
    if self.version_checkout {
      Some(self)
    } else {
      None
    }
  }
}

#[async_trait]
impl VersionCheckout for HttpDownloader {
  async fn checkout_version(&self, keys: &[String], token: TypeToken) -> Result<VersionPackage> {
    let url = self.endpoint(token, "versions")?;
    let response: ApiVersionsResponse = self.post_keys(url, keys).await?;

    Ok(response.into_package(token))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use tokio::task::JoinHandle;

  const ARTICLE: TypeToken = TypeToken::new("article");

  fn remote_config(url: &str) -> RemoteConfig {
    RemoteConfig {
      url: url.to_string(),
      timeout_seconds: 5,
      version_checkout: true,
    }
  }

  /// Serve exactly one HTTP response and hand back the raw request.
  async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/api", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut request = Vec::new();
      let mut buf = [0u8; 4096];

      // Read headers, then as much body as Content-Length announces
      loop {
        let n = socket.read(&mut buf).await.unwrap();
        request.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&request).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
          let content_length = text[..header_end]
            .lines()
            .find_map(|l| {
              let (name, value) = l.split_once(':')?;
              name
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
            })
            .unwrap_or(0);
          if request.len() >= header_end + 4 + content_length {
            break;
          }
        }
        if n == 0 {
          break;
        }
      }

      let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      String::from_utf8_lossy(&request).to_string()
    });

    (base, handle)
  }

  #[test]
  fn test_endpoint_building() {
    let downloader = HttpDownloader::new(&remote_config("http://localhost:9000/api/")).unwrap();
    assert_eq!(
      downloader.endpoint(ARTICLE, "objects").unwrap().as_str(),
      "http://localhost:9000/api/article/objects"
    );

    let downloader = HttpDownloader::new(&remote_config("http://localhost:9000/api")).unwrap();
    assert_eq!(
      downloader.endpoint(ARTICLE, "versions").unwrap().as_str(),
      "http://localhost:9000/api/article/versions"
    );
  }

  #[test]
  fn test_version_checkout_capability_follows_config() {
    let mut config = remote_config("http://localhost/");
    assert!(HttpDownloader::new(&config).unwrap().version_checkout().is_some());

    config.version_checkout = false;
    assert!(HttpDownloader::new(&config).unwrap().version_checkout().is_none());
  }

  #[test]
  fn test_rejects_invalid_url() {
    assert!(HttpDownloader::new(&remote_config("not a url")).is_err());
  }

  #[tokio::test]
  async fn test_download_objects() {
    let (base, server) = serve_once(
      "200 OK",
      r#"{"objects": [{"id": "a", "version": "2", "payload": {"title": "A"}}]}"#,
    )
    .await;
    let downloader = HttpDownloader::new(&remote_config(&base)).unwrap();

    let objects = downloader
      .download_objects(&["a".to_string(), "b".to_string()], ARTICLE)
      .await
      .unwrap();

    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].id(), "a");
    assert_eq!(objects[0].version(), "2");

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /api/article/objects"));
    assert!(request.contains(r#"{"keys":["a","b"]}"#));
  }

  #[tokio::test]
  async fn test_error_status_is_a_failure() {
    let (base, server) = serve_once("503 Service Unavailable", "{}").await;
    let downloader = HttpDownloader::new(&remote_config(&base)).unwrap();

    let result = downloader.download_objects(&["a".to_string()], ARTICLE).await;
    assert!(result.is_err());
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_checkout_version() {
    let (base, server) = serve_once(
      "200 OK",
      r#"{"versions": {"a": "3"}, "ignored": ["b"]}"#,
    )
    .await;
    let downloader = HttpDownloader::new(&remote_config(&base)).unwrap();

    let package = downloader
      .checkout_version(&["a".to_string(), "b".to_string()], ARTICLE)
      .await
      .unwrap();

    assert_eq!(package.versions()["a"], "3");
    assert_eq!(package.ignored(), ["b".to_string()].as_slice());

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /api/article/versions"));
  }
}
