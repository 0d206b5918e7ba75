//! Fetch interception: serve manifest resources from the live partition.

use color_eyre::Result;
use tracing::{debug, warn};

use super::ServiceWorker;
use crate::cache::{CacheResult, CacheStore, RequestKey, Response};
use crate::manifest::ROOT_KEY;
use crate::net::{FetchOptions, Fetcher};

/// What the worker did with an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not ours; the host should handle the request normally
  Passthrough,
  /// The worker produced a response
  Respond(CacheResult<Response>),
}

#[cfg(test)]
impl FetchOutcome {
  pub fn is_passthrough(&self) -> bool {
    matches!(self, Self::Passthrough)
  }
}

impl<S: CacheStore, F: Fetcher> ServiceWorker<S, F> {
  /// Handle a request from a client page.
  ///
  /// Only GET requests for keys listed in the manifest are intercepted. The
  /// root document is served online-first, everything else cache-first.
  pub async fn fetch(&self, request: &RequestKey) -> Result<FetchOutcome> {
    if !request.is_get() {
      return Ok(FetchOutcome::Passthrough);
    }

    let Some(key) = self.config.origin.request_key(&request.url) else {
      return Ok(FetchOutcome::Passthrough);
    };
    if !self.config.manifest.contains(&key) {
      debug!(%key, "Not in manifest, passing through");
      return Ok(FetchOutcome::Passthrough);
    }

    // Fragments never reach the network or the cache key
    let mut request = request.clone();
    request.url.set_fragment(None);

    let served = if key == ROOT_KEY {
      self.online_first(&request).await?
    } else {
      self.cache_first(&request).await?
    };
    Ok(FetchOutcome::Respond(served))
  }

  /// Prefer the network; fall back to the cached copy only when the network
  /// fails. Without a cached copy the network error is returned as is.
  async fn online_first(&self, request: &RequestKey) -> Result<CacheResult<Response>> {
    match self.fetcher.fetch(request, FetchOptions::default()).await {
      Ok(response) => {
        self.store_lazily(request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(network_err) => {
        let cached = self
          .store
          .open(&self.config.partitions.live)
          .and_then(|live| live.get(request));
        match cached {
          Ok(Some(cached)) => {
            warn!(url = %request.url, "Network failed, serving cached copy: {}", network_err);
            Ok(CacheResult::offline(cached.response, cached.cached_at))
          }
          Ok(None) => Err(network_err),
          Err(cache_err) => {
            warn!(url = %request.url, "Failed to read cached copy: {}", cache_err);
            Err(network_err)
          }
        }
      }
    }
  }

  /// Serve from cache; on a miss fetch and keep the response if it is a
  /// success.
  async fn cache_first(&self, request: &RequestKey) -> Result<CacheResult<Response>> {
    let live = self.store.open(&self.config.partitions.live)?;
    if let Some(cached) = live.get(request)? {
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = self.fetcher.fetch(request, FetchOptions::default()).await?;
    if response.is_ok() {
      self.store_lazily(request, &response);
    } else {
      debug!(url = %request.url, status = response.status, "Not caching unsuccessful response");
    }
    Ok(CacheResult::from_network(response))
  }

  /// Write a copy into live. Failure only costs the cache entry.
  fn store_lazily(&self, request: &RequestKey, response: &Response) {
    let stored = self
      .store
      .open(&self.config.partitions.live)
      .and_then(|live| live.put(request, response));
    if let Err(e) = stored {
      warn!(url = %request.url, "Failed to cache response: {}", e);
    }
  }
}
