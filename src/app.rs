//! Host side: delivers lifecycle signals to the worker and reports results.

use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheResult, CacheSource, CacheStore, RequestKey, Response, SqliteStore};
use crate::config::Config;
use crate::manifest::ResourceManifest;
use crate::net::{FetchOptions, Fetcher, HttpFetcher};
use crate::worker::{
  ActivationKind, ActivationReport, FetchOutcome, Message, ServiceWorker, Signal, SignalOutcome,
};
use crate::Command;

/// Main application state
pub struct App {
  store: Arc<SqliteStore>,
  fetcher: Arc<HttpFetcher>,
  worker: ServiceWorker<SqliteStore, HttpFetcher>,
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    let worker_config = config.worker_config()?;
    let store = Arc::new(SqliteStore::open_at(config.database_path().as_deref())?);
    let fetcher = Arc::new(HttpFetcher::new(config.user_agent.as_deref())?);
    let worker = ServiceWorker::new(worker_config, Arc::clone(&store), Arc::clone(&fetcher))?;

    Ok(Self {
      store,
      fetcher,
      worker,
    })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Install => self.signal(Signal::Install).await,
      Command::Activate => self.signal(Signal::Activate).await,
      Command::Upgrade => {
        // Activation only runs once install has fully resolved
        self.signal(Signal::Install).await?;
        self.signal(Signal::Activate).await
      }
      Command::Fetch {
        url,
        method,
        output,
      } => self.fetch(&url, &method, output.as_deref()).await,
      Command::Message { payload } => {
        let message: Message = payload.parse()?;
        self.signal(Signal::Message(message)).await
      }
      Command::Status => self.status(),
    }
  }

  async fn signal(&self, signal: Signal) -> Result<()> {
    debug!(?signal, "Delivering signal");
    match self.worker.handle(signal).await? {
      SignalOutcome::Installed(report) => {
        println!("Staged {} shell resources", report.staged.len());
      }
      SignalOutcome::Activated(report) => print_activation(&report),
      SignalOutcome::SkipWaiting => println!("Worker will replace any waiting version"),
      SignalOutcome::Synced(report) => println!(
        "Downloaded {} resources ({} already cached)",
        report.fetched.len(),
        report.already_cached
      ),
      other => return Err(eyre!("Unexpected outcome for signal: {:?}", other)),
    }
    println!(
      "{}",
      lifecycle_flags(self.worker.is_skip_waiting(), self.worker.has_claimed_clients())
    );
    Ok(())
  }

  async fn fetch(&self, url: &str, method: &str, output: Option<&Path>) -> Result<()> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    let request = RequestKey::new(method, url);

    let served = match self.worker.handle(Signal::Fetch(request.clone())).await? {
      SignalOutcome::Fetched(FetchOutcome::Respond(served)) => served,
      SignalOutcome::Fetched(FetchOutcome::Passthrough) => {
        // Not a manifest resource: plain network handling
        info!(url = %request.url, "Passing request through to network");
        let response = self.fetcher.fetch(&request, FetchOptions::default()).await?;
        eprintln!("{} {} (passthrough)", response.status, request.url);
        return write_body(&response, output);
      }
      other => return Err(eyre!("Unexpected outcome for fetch: {:?}", other)),
    };

    print_served(&request, &served);
    write_body(&served.data, output)
  }

  fn status(&self) -> Result<()> {
    let config = self.worker.config();
    println!("origin:    {}", config.origin);
    println!("state:     {}", self.worker.state());
    println!(
      "manifest:  {} resources, {} in shell",
      config.manifest.len(),
      config.shell.len()
    );

    let names = &config.partitions;
    let manifest_request = config.origin.manifest_request()?;
    match self.store.get_entry(&names.manifest, &manifest_request)? {
      Some(stored) => {
        let previous = ResourceManifest::from_json(&stored.response.body)?;
        let diff = config.manifest.diff(&previous);
        println!(
          "stored:    {} (vs current: {} unchanged, {} added, {} changed, {} removed)",
          stored.cached_at.format("%Y-%m-%d %H:%M:%S UTC"),
          diff.unchanged.len(),
          diff.added.len(),
          diff.changed.len(),
          diff.removed.len()
        );
      }
      None => println!("stored:    none"),
    }

    println!("partitions:");
    for (name, count) in self.store.entry_counts()? {
      let role = if name == names.live {
        " (live)"
      } else if name == names.staging {
        " (staging)"
      } else if name == names.manifest {
        " (manifest)"
      } else {
        ""
      };
      println!("  {}{}: {} entries", name, role, count);
    }
    Ok(())
  }
}

fn print_activation(report: &ActivationReport) {
  match report.kind {
    ActivationKind::FirstInstall => {
      println!("First install: {} shell resources live", report.promoted.len())
    }
    ActivationKind::Upgrade => println!(
      "Upgraded: {} kept, {} evicted, {} shell resources refreshed",
      report.retained.len(),
      report.evicted.len(),
      report.promoted.len()
    ),
    ActivationKind::Reset => println!(
      "Activation failed, offline cache reset: {}",
      report.error.as_deref().unwrap_or("unknown error")
    ),
  }
}

/// Worker flags as seen by the host after a signal. Both live only as long as
/// the worker, so `status` in a fresh process cannot report them.
fn lifecycle_flags(skip_waiting: bool, clients_claimed: bool) -> String {
  let yes_no = |flag: bool| if flag { "yes" } else { "no" };
  format!(
    "skip waiting: {}, clients claimed: {}",
    yes_no(skip_waiting),
    yes_no(clients_claimed)
  )
}

fn print_served(request: &RequestKey, served: &CacheResult<Response>) {
  if served.source == CacheSource::Offline {
    warn!(url = %request.url, "Network unavailable, served cached copy");
  }
  if let Some(content_type) = served.data.header("content-type") {
    debug!(%content_type, "Response content type");
  }
  match served.cached_at {
    Some(at) => eprintln!(
      "{} {} ({}, cached {})",
      served.data.status,
      request.url,
      served.source,
      at.format("%Y-%m-%d %H:%M:%S UTC")
    ),
    None => eprintln!("{} {} ({})", served.data.status, request.url, served.source),
  }
}

fn write_body(response: &Response, output: Option<&Path>) -> Result<()> {
  match output {
    Some(path) => std::fs::write(path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e)),
    None => std::io::stdout()
      .write_all(&response.body)
      .map_err(|e| eyre!("Failed to write response body: {}", e)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lifecycle_flags() {
    assert_eq!(
      lifecycle_flags(false, false),
      "skip waiting: no, clients claimed: no"
    );
    assert_eq!(
      lifecycle_flags(true, true),
      "skip waiting: yes, clients claimed: yes"
    );
  }
}
