//! On-demand full sync: download every manifest resource not yet cached.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use tracing::{error, info};

use super::ServiceWorker;
use crate::cache::{CacheStore, RequestKey};
use crate::net::{FetchOptions, Fetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  /// Keys downloaded by this sync
  pub fetched: Vec<String>,
  /// Manifest keys that were already cached
  pub already_cached: usize,
}

impl<S: CacheStore, F: Fetcher> ServiceWorker<S, F> {
  /// Make every manifest resource available offline.
  pub async fn download_offline(&self) -> Result<SyncReport> {
    let config = &self.config;
    let live = self.store.open(&config.partitions.live)?;

    let present: HashSet<String> = live
      .keys()?
      .iter()
      .filter_map(|request| config.origin.stored_key(&request.url))
      .collect();

    let missing: Vec<String> = config
      .manifest
      .keys()
      .filter(|key| !present.contains(*key))
      .map(String::from)
      .collect();
    let already_cached = config.manifest.len() - missing.len();

    if missing.is_empty() {
      info!("All resources already available offline");
      return Ok(SyncReport {
        fetched: missing,
        already_cached,
      });
    }

    let requests = missing
      .iter()
      .map(|key| config.origin.request_for(key))
      .collect::<Result<Vec<RequestKey>>>()?;

    info!(missing = requests.len(), "Downloading resources for offline use");
    self
      .add_all(&config.partitions.live, &requests, FetchOptions::default(), false)
      .await
      .map_err(|e| {
        error!("Offline download failed: {}", e);
        eyre!("Failed to download offline resources: {}", e)
      })?;

    Ok(SyncReport {
      fetched: missing,
      already_cached,
    })
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::super::testing::*;
  use crate::cache::{CacheStore, Response, SqliteStore};
  use crate::net::testing::ScriptedFetcher;
  use crate::worker::{Message, PartitionNames, Signal, SignalOutcome};

  fn setup() -> (Arc<SqliteStore>, Arc<ScriptedFetcher>, TestWorker) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let w = worker(
      config(
        manifest(&[("/", "h1"), ("main.js", "h2"), ("logo.png", "p1")]),
        shell(&["main.js"]),
      ),
      &store,
      &fetcher,
    );
    (store, fetcher, w)
  }

  #[tokio::test]
  async fn test_downloads_only_missing_resources() {
    let (store, fetcher, w) = setup();
    let names = PartitionNames::default();
    store
      .put_entry(&names.live, &request("main.js"), &Response::new(200, "js"))
      .unwrap();
    serve(&fetcher, "/", "<html>");
    serve(&fetcher, "logo.png", "png");

    let outcome = w
      .handle(Signal::Message(Message::DownloadOffline))
      .await
      .unwrap();
    let SignalOutcome::Synced(report) = outcome else {
      panic!("expected sync report");
    };

    assert_eq!(report.fetched, vec!["/", "logo.png"]);
    assert_eq!(report.already_cached, 1);
    assert_eq!(live_keys(&store), vec!["/", "logo.png", "main.js"]);

    let mut fetched: Vec<String> = fetcher.calls().into_iter().map(|(u, _)| u).collect();
    fetched.sort();
    assert_eq!(fetched, vec![url("/"), url("logo.png")]);
  }

  #[tokio::test]
  async fn test_nothing_missing_makes_no_requests() {
    let (_store, fetcher, w) = setup();
    serve(&fetcher, "/", "<html>");
    serve(&fetcher, "main.js", "js");
    serve(&fetcher, "logo.png", "png");
    w.download_offline().await.unwrap();
    fetcher.clear_calls();

    let report = w.download_offline().await.unwrap();
    assert!(report.fetched.is_empty());
    assert_eq!(report.already_cached, 3);
    assert!(fetcher.calls().is_empty());
  }

  #[tokio::test]
  async fn test_partial_failure_stores_nothing() {
    let (store, fetcher, w) = setup();
    serve(&fetcher, "/", "<html>");
    serve(&fetcher, "main.js", "js");
    // logo.png unreachable

    let err = w.download_offline().await.unwrap_err();
    assert!(err.to_string().contains("1 of 3"));
    assert!(live_keys(&store).is_empty());
  }

  #[tokio::test]
  async fn test_error_status_fails_the_batch() {
    let (store, fetcher, w) = setup();
    serve(&fetcher, "/", "<html>");
    serve(&fetcher, "main.js", "js");
    fetcher.respond(&url("logo.png"), Response::new(503, "unavailable"));

    let err = w.download_offline().await.unwrap_err();
    assert!(err.to_string().contains("status 503"));
    assert!(live_keys(&store).is_empty());
  }
}
