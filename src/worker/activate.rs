//! Activate: reconcile the live partition against the previous build.

use color_eyre::Result;
use tracing::{debug, error, info, warn};

use super::{ReconcileState, ServiceWorker};
use crate::cache::{CacheStore, Response};
use crate::manifest::ResourceManifest;
use crate::net::Fetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
  /// No stored manifest: live was rebuilt from the staged shell only
  FirstInstall,
  /// Stored manifest found: unchanged resources were carried over
  Upgrade,
  /// Reconciliation failed and every partition was deleted
  Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  pub kind: ActivationKind,
  /// Live entries removed because their resource changed or disappeared
  pub evicted: Vec<String>,
  /// Live entries kept from the previous build
  pub retained: Vec<String>,
  /// Staged entries copied into live
  pub promoted: Vec<String>,
  /// Why reconciliation failed, for `Reset`
  pub error: Option<String>,
}

impl ActivationReport {
  fn new(kind: ActivationKind) -> Self {
    Self {
      kind,
      evicted: Vec::new(),
      retained: Vec::new(),
      promoted: Vec::new(),
      error: None,
    }
  }
}

impl<S: CacheStore, F: Fetcher> ServiceWorker<S, F> {
  /// Merge staged shell files into the live partition, evict entries whose
  /// fingerprint changed, and record the current manifest for the next
  /// upgrade.
  ///
  /// Any failure along the way deletes all three partitions: an empty cache
  /// is preferred over a partially reconciled one. Activation itself still
  /// completes in that case and reports [`ActivationKind::Reset`].
  pub async fn activate(&self) -> Result<ActivationReport> {
    self.transition(ReconcileState::Reconciling)?;

    match self.reconcile() {
      Ok(report) => {
        self.transition(ReconcileState::Live)?;
        self.claim_clients();
        info!(
          kind = ?report.kind,
          evicted = report.evicted.len(),
          retained = report.retained.len(),
          promoted = report.promoted.len(),
          "Activation complete"
        );
        Ok(report)
      }
      Err(err) => {
        error!("Failed to upgrade offline cache: {:#}", err);
        self.transition(ReconcileState::Failed)?;
        self.reset();
        self.transition(ReconcileState::Empty)?;

        let mut report = ActivationReport::new(ActivationKind::Reset);
        report.error = Some(format!("{:#}", err));
        Ok(report)
      }
    }
  }

  fn reconcile(&self) -> Result<ActivationReport> {
    let names = &self.config.partitions;
    let origin = &self.config.origin;
    let current = &self.config.manifest;

    let live = self.store.open(&names.live)?;
    let staging = self.store.open(&names.staging)?;
    let manifest_store = self.store.open(&names.manifest)?;

    let manifest_request = origin.manifest_request()?;
    let previous = match manifest_store.get(&manifest_request)? {
      Some(stored) => Some(ResourceManifest::from_json(&stored.response.body)?),
      None => None,
    };

    let mut report = match &previous {
      None => {
        // Whatever is in live did not come from a build we know about
        self.store.delete_partition(&names.live)?;
        ActivationReport::new(ActivationKind::FirstInstall)
      }
      Some(previous) => {
        let mut report = ActivationReport::new(ActivationKind::Upgrade);
        for request in live.keys()? {
          let key = origin.stored_key(&request.url);
          let keep = key
            .as_deref()
            .is_some_and(|k| current.is_unchanged(previous, k));

          let label = key.unwrap_or_else(|| request.url.to_string());
          if keep {
            report.retained.push(label);
          } else {
            live.delete(&request)?;
            debug!(key = %label, "Evicted stale resource");
            report.evicted.push(label);
          }
        }
        report
      }
    };

    // Shell files are always the freshest copy
    let live = self.store.open(&names.live)?;
    for request in staging.keys()? {
      if let Some(staged) = staging.get(&request)? {
        live.put(&request, &staged.response)?;
        report.promoted.push(
          origin
            .stored_key(&request.url)
            .unwrap_or_else(|| request.url.to_string()),
        );
      }
    }
    self.store.delete_partition(&names.staging)?;

    let stored = Response::new(200, current.to_json()?)
      .with_header("Content-Type", "application/json");
    manifest_store.put(&manifest_request, &stored)?;

    Ok(report)
  }

  /// Delete every partition, attempting each even if another fails.
  fn reset(&self) {
    for name in self.config.partitions.all() {
      match self.store.delete_partition(name) {
        Ok(_) => debug!(partition = name, "Deleted cache partition"),
        Err(e) => warn!(partition = name, "Failed to delete cache partition: {}", e),
      }
    }
  }
}
