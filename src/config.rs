use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::manifest::{ResourceManifest, ShellList};
use crate::worker::{Origin, PartitionNames, WorkerConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the application is served from, e.g. `https://app.example.com`
  pub origin: String,
  /// JSON resource table (`{"key": "fingerprint"}`), relative to the config file
  pub manifest: Option<PathBuf>,
  /// Inline resource table, used when `manifest` is not set
  pub resources: Option<BTreeMap<String, String>>,
  /// Application shell keys, fetched on install
  #[serde(default)]
  pub shell: Vec<String>,
  #[serde(default)]
  pub partitions: PartitionNames,
  /// SQLite cache database (defaults to $XDG_DATA_HOME/shellcache/cache.db)
  pub database: Option<PathBuf>,
  pub user_agent: Option<String>,

  /// Directory of the loaded config file, for resolving relative paths
  #[serde(skip)]
  base_dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shellcache/config.yaml\n\
                 or pass --config <path>."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config.base_dir = path.parent().map(Path::to_path_buf);

    Ok(config)
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Resolve a path from the config file against the file's directory.
  fn resolve_path(&self, path: &Path) -> PathBuf {
    match &self.base_dir {
      Some(base) if path.is_relative() => base.join(path),
      _ => path.to_path_buf(),
    }
  }

  pub fn database_path(&self) -> Option<PathBuf> {
    self.database.as_deref().map(|p| self.resolve_path(p))
  }

  /// Load the resource table from the manifest file or the inline table.
  pub fn load_manifest(&self) -> Result<ResourceManifest> {
    match (&self.manifest, &self.resources) {
      (Some(_), Some(_)) => Err(eyre!(
        "Config sets both `manifest` and `resources`; use one"
      )),
      (Some(path), None) => {
        let path = self.resolve_path(path);
        let bytes = std::fs::read(&path)
          .map_err(|e| eyre!("Failed to read manifest {}: {}", path.display(), e))?;
        ResourceManifest::from_json(&bytes)
          .map_err(|e| eyre!("Invalid manifest {}: {}", path.display(), e))
      }
      (None, Some(resources)) => Ok(ResourceManifest::new(resources.clone())),
      (None, None) => Err(eyre!(
        "Config must set `manifest` (path to a JSON resource table) or `resources`"
      )),
    }
  }

  /// Build the immutable worker configuration for this build.
  pub fn worker_config(&self) -> Result<WorkerConfig> {
    let origin = Origin::parse(&self.origin)?;
    let manifest = self.load_manifest()?;
    let shell = ShellList::new(self.shell.clone());
    WorkerConfig::new(origin, manifest, shell, self.partitions.clone())
  }
}
