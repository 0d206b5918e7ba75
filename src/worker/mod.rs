//! Offline cache worker: install, activate, fetch interception and
//! on-demand sync over three named cache partitions.
//!
//! The host (see `main.rs`) delivers lifecycle signals; the worker never
//! decides on its own when to install or activate.

mod activate;
mod install;
mod intercept;
mod key;
mod state;
mod sync;

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::cache::{CacheStore, RequestKey};
use crate::manifest::{ResourceManifest, ShellList};
use crate::net::{FetchOptions, Fetcher};

pub use activate::{ActivationKind, ActivationReport};
pub use install::InstallReport;
pub use intercept::FetchOutcome;
pub use key::Origin;
pub use state::ReconcileState;
pub use sync::SyncReport;

/// Names of the three cache partitions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PartitionNames {
  pub staging: String,
  pub live: String,
  pub manifest: String,
}

impl Default for PartitionNames {
  fn default() -> Self {
    Self {
      staging: "app-temp-cache".to_string(),
      live: "app-cache".to_string(),
      manifest: "app-manifest".to_string(),
    }
  }
}

impl PartitionNames {
  pub fn all(&self) -> [&str; 3] {
    [
      self.live.as_str(),
      self.staging.as_str(),
      self.manifest.as_str(),
    ]
  }

  pub fn validate(&self) -> Result<()> {
    let [live, staging, manifest] = self.all();
    if live == staging || live == manifest || staging == manifest {
      return Err(eyre!("Cache partition names must be distinct"));
    }
    if self.all().iter().any(|n| n.trim().is_empty()) {
      return Err(eyre!("Cache partition names must not be empty"));
    }
    Ok(())
  }
}

/// Immutable per-build configuration handed to the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub origin: Origin,
  pub manifest: ResourceManifest,
  pub shell: ShellList,
  pub partitions: PartitionNames,
}

impl WorkerConfig {
  pub fn new(
    origin: Origin,
    manifest: ResourceManifest,
    shell: ShellList,
    partitions: PartitionNames,
  ) -> Result<Self> {
    if manifest.is_empty() {
      return Err(eyre!("Resource manifest is empty"));
    }
    for key in manifest.keys() {
      origin.resolve(key)?;
    }
    shell.validate(&manifest)?;
    partitions.validate()?;
    Ok(Self {
      origin,
      manifest,
      shell,
      partitions,
    })
  }
}

/// Lifecycle signals delivered by the host.
#[derive(Debug, Clone)]
pub enum Signal {
  Install,
  Activate,
  Fetch(RequestKey),
  Message(Message),
}

/// Payloads accepted through the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
  SkipWaiting,
  DownloadOffline,
}

impl FromStr for Message {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "skipWaiting" => Ok(Self::SkipWaiting),
      "downloadOffline" => Ok(Self::DownloadOffline),
      other => Err(eyre!(
        "Unknown message '{}' (expected skipWaiting or downloadOffline)",
        other
      )),
    }
  }
}

/// What handling a signal produced.
#[derive(Debug)]
pub enum SignalOutcome {
  Installed(InstallReport),
  Activated(ActivationReport),
  Fetched(FetchOutcome),
  SkipWaiting,
  Synced(SyncReport),
}

/// The cache reconciler.
pub struct ServiceWorker<S: CacheStore, F: Fetcher> {
  config: Arc<WorkerConfig>,
  store: Arc<S>,
  fetcher: Arc<F>,
  state: Mutex<ReconcileState>,
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
}

impl<S: CacheStore, F: Fetcher> ServiceWorker<S, F> {
  /// Create a worker over an existing store. The starting state is read
  /// from what the store already holds.
  pub fn new(config: WorkerConfig, store: Arc<S>, fetcher: Arc<F>) -> Result<Self> {
    let state = detect_state(&config, store.as_ref())?;
    debug!(%state, origin = %config.origin, "Worker created");

    Ok(Self {
      config: Arc::new(config),
      store,
      fetcher,
      state: Mutex::new(state),
      skip_waiting: AtomicBool::new(false),
      clients_claimed: AtomicBool::new(false),
    })
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn state(&self) -> ReconcileState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(ReconcileState::Failed)
  }

  /// Whether this worker asked to replace a waiting predecessor immediately.
  pub fn is_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Whether this worker has taken control of open clients.
  pub fn has_claimed_clients(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }

  /// Dispatch one lifecycle signal.
  pub async fn handle(&self, signal: Signal) -> Result<SignalOutcome> {
    match signal {
      Signal::Install => self.install().await.map(SignalOutcome::Installed),
      Signal::Activate => self.activate().await.map(SignalOutcome::Activated),
      Signal::Fetch(request) => self.fetch(&request).await.map(SignalOutcome::Fetched),
      Signal::Message(Message::SkipWaiting) => {
        self.request_skip_waiting();
        Ok(SignalOutcome::SkipWaiting)
      }
      Signal::Message(Message::DownloadOffline) => {
        self.download_offline().await.map(SignalOutcome::Synced)
      }
    }
  }

  fn request_skip_waiting(&self) {
    if !self.skip_waiting.swap(true, Ordering::SeqCst) {
      debug!("Skip waiting requested");
    }
  }

  fn claim_clients(&self) {
    if !self.clients_claimed.swap(true, Ordering::SeqCst) {
      debug!("Claimed clients");
    }
  }

  fn transition(&self, to: ReconcileState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let from = *state;
    *state = from.transition(to)?;
    debug!(%from, %to, "Cache state changed");
    Ok(())
  }

  /// Fetch every request and store the responses in `partition`.
  ///
  /// All-or-nothing: a transport failure or a non-2xx status on any request
  /// fails the batch and nothing is stored. With `replace`, the partition is
  /// emptied before the new responses are written, so it ends up holding
  /// exactly this batch.
  async fn add_all(
    &self,
    partition: &str,
    requests: &[RequestKey],
    options: FetchOptions,
    replace: bool,
  ) -> Result<()> {
    let results = join_all(
      requests
        .iter()
        .map(|request| self.fetcher.fetch(request, options)),
    )
    .await;

    let mut responses = Vec::with_capacity(requests.len());
    let mut failures = Vec::new();
    for (request, result) in requests.iter().zip(results) {
      match result {
        Ok(response) if response.is_ok() => responses.push((request, response)),
        Ok(response) => failures.push(format!("{} (status {})", request.url, response.status)),
        Err(err) => failures.push(format!("{} ({})", request.url, err)),
      }
    }

    if !failures.is_empty() {
      return Err(eyre!(
        "Failed to fetch {} of {} resources: {}",
        failures.len(),
        requests.len(),
        failures.join("; ")
      ));
    }

    if replace && self.store.delete_partition(partition)? {
      debug!(partition, "Cleared partition before refill");
    }

    let target = self.store.open(partition)?;
    for (request, response) in responses {
      target.put(request, &response)?;
    }
    Ok(())
  }
}

fn detect_state<S: CacheStore>(config: &WorkerConfig, store: &S) -> Result<ReconcileState> {
  let names = &config.partitions;
  if store.has_partition(&names.staging)? && !store.entry_keys(&names.staging)?.is_empty() {
    return Ok(ReconcileState::Staged);
  }

  let manifest_request = config.origin.manifest_request()?;
  if store.has_partition(&names.manifest)?
    && store
      .get_entry(&names.manifest, &manifest_request)?
      .is_some()
  {
    return Ok(ReconcileState::Live);
  }

  Ok(ReconcileState::Empty)
}


#[cfg(test)]
mod tests {
  use super::testing::*;
  use super::*;
  use crate::cache::SqliteStore;
  use crate::net::testing::ScriptedFetcher;

  #[test]
  fn test_message_parsing() {
    assert_eq!(
      "skipWaiting".parse::<Message>().unwrap(),
      Message::SkipWaiting
    );
    assert_eq!(
      "downloadOffline".parse::<Message>().unwrap(),
      Message::DownloadOffline
    );
    let err = "reload".parse::<Message>().unwrap_err();
    assert!(err.to_string().contains("reload"));
  }

  #[test]
  fn test_partition_names_must_be_distinct() {
    let names = PartitionNames {
      staging: "same".into(),
      live: "same".into(),
      manifest: "m".into(),
    };
    assert!(names.validate().is_err());
    assert!(PartitionNames::default().validate().is_ok());
  }

  #[test]
  fn test_config_rejects_shell_outside_manifest() {
    let result = WorkerConfig::new(
      Origin::parse(ORIGIN).unwrap(),
      manifest(&[("/", "h1")]),
      shell(&["main.js"]),
      PartitionNames::default(),
    );
    assert!(result.is_err());
  }

  #[test]
  fn test_config_rejects_empty_manifest() {
    let result = WorkerConfig::new(
      Origin::parse(ORIGIN).unwrap(),
      manifest(&[]),
      shell(&[]),
      PartitionNames::default(),
    );
    assert!(result.unwrap_err().to_string().contains("empty"));
  }

  #[test]
  fn test_config_rejects_keys_outside_origin() {
    let result = WorkerConfig::new(
      Origin::parse(ORIGIN).unwrap(),
      manifest(&[("/", "h1"), ("https://cdn.test/x.js", "h2")]),
      shell(&[]),
      PartitionNames::default(),
    );
    let err = result.unwrap_err().to_string();
    assert!(err.contains("https://cdn.test/x.js"));
    assert!(err.contains("outside origin"));
  }

  #[tokio::test]
  async fn test_skip_waiting_message() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let w = worker(config(manifest(&[("/", "h1")]), shell(&[])), &store, &fetcher);

    assert!(!w.is_skip_waiting());
    let outcome = w
      .handle(Signal::Message(Message::SkipWaiting))
      .await
      .unwrap();
    assert!(matches!(outcome, SignalOutcome::SkipWaiting));
    assert!(w.is_skip_waiting());
  }

  #[tokio::test]
  async fn test_initial_state_detected_from_store() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    serve(&fetcher, "main.js", "js");
    let cfg = config(manifest(&[("/", "h1"), ("main.js", "h2")]), shell(&["main.js"]));

    let w = worker(cfg.clone(), &store, &fetcher);
    assert_eq!(w.state(), ReconcileState::Empty);
    w.handle(Signal::Install).await.unwrap();

    // A new worker over the same store sees the staged shell
    assert_eq!(worker(cfg.clone(), &store, &fetcher).state(), ReconcileState::Staged);

    w.handle(Signal::Activate).await.unwrap();
    assert_eq!(worker(cfg, &store, &fetcher).state(), ReconcileState::Live);
  }
}
