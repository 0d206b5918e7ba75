//! Install: stage the application shell.

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};

use super::{ReconcileState, ServiceWorker};
use crate::cache::{CacheStore, RequestKey};
use crate::net::{FetchOptions, Fetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  /// Shell keys written to the staging partition, in shell order
  pub staged: Vec<String>,
}

impl<S: CacheStore, F: Fetcher> ServiceWorker<S, F> {
  /// Fetch every shell resource, bypassing HTTP caches, into the staging
  /// partition. Nothing is staged unless every resource succeeds, and a
  /// successful install replaces whatever an earlier install staged.
  pub async fn install(&self) -> Result<InstallReport> {
    // Supersede any waiting predecessor as soon as this version installs
    self.request_skip_waiting();

    let config = &self.config;
    if config.shell.is_empty() {
      warn!("Application shell is empty, nothing to stage");
    }
    let requests = config
      .shell
      .iter()
      .map(|key| config.origin.request_for(key))
      .collect::<Result<Vec<RequestKey>>>()?;

    info!(
      resources = requests.len(),
      partition = %config.partitions.staging,
      "Installing application shell"
    );

    self
      .add_all(
        &config.partitions.staging,
        &requests,
        FetchOptions::revalidate(),
        true,
      )
      .await
      .map_err(|e| {
        error!("Install failed: {}", e);
        eyre!("Failed to install application shell: {}", e)
      })?;

    self.transition(ReconcileState::Staged)?;

    Ok(InstallReport {
      staged: config.shell.iter().map(String::from).collect(),
    })
  }
}
