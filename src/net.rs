//! Network fetch primitive used to populate the cache.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, CACHE_CONTROL, PRAGMA};

use crate::cache::{RequestKey, Response};

/// Options for a single fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
  /// Bypass intermediate HTTP caches and revalidate with the origin
  pub force_revalidate: bool,
}

impl FetchOptions {
  pub fn revalidate() -> Self {
    Self {
      force_revalidate: true,
    }
  }
}

/// Anything that can turn a request into a response over the network.
///
/// An `Err` means the request never produced a response (DNS, connection,
/// TLS...). HTTP error statuses are successful fetches with a non-2xx status.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &RequestKey, options: FetchOptions) -> Result<Response>;
}

/// HTTP fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(user_agent: Option<&str>) -> Result<Self> {
    let user_agent = user_agent.unwrap_or(concat!("shellcache/", env!("CARGO_PKG_VERSION")));

    let client = reqwest::Client::builder()
      .user_agent(user_agent)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &RequestKey, options: FetchOptions) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    if options.force_revalidate {
      builder = builder
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(PRAGMA, HeaderValue::from_static("no-cache"));
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
