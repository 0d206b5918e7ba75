//! Resource manifest and application shell list.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Logical key of the entry document.
pub const ROOT_KEY: &str = "/";

/// Mapping from logical resource key to content fingerprint for one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceManifest(BTreeMap<String, String>);

impl ResourceManifest {
  pub fn new(entries: BTreeMap<String, String>) -> Self {
    Self(entries)
  }

  /// Parse a manifest from its JSON object form (`{"key": "fingerprint", ...}`).
  pub fn from_json(bytes: &[u8]) -> Result<Self> {
    serde_json::from_slice(bytes).map_err(|e| eyre!("Failed to parse resource manifest: {}", e))
  }

  pub fn to_json(&self) -> Result<Vec<u8>> {
    serde_json::to_vec(&self.0).map_err(|e| eyre!("Failed to serialize resource manifest: {}", e))
  }

  pub fn fingerprint(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(String::as_str)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.0.contains_key(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Whether a cached copy of `key` recorded under `previous` is still valid
  /// for this build.
  pub fn is_unchanged(&self, previous: &ResourceManifest, key: &str) -> bool {
    match (self.fingerprint(key), previous.fingerprint(key)) {
      (Some(current), Some(old)) => current == old,
      _ => false,
    }
  }

  /// Compare against the manifest of a previous build.
  pub fn diff(&self, previous: &ResourceManifest) -> ManifestDiff {
    let mut diff = ManifestDiff::default();
    for (key, fingerprint) in &self.0 {
      match previous.fingerprint(key) {
        None => diff.added.push(key.clone()),
        Some(old) if old != fingerprint => diff.changed.push(key.clone()),
        Some(_) => diff.unchanged.push(key.clone()),
      }
    }
    diff.removed = previous
      .keys()
      .filter(|k| !self.contains(k))
      .map(String::from)
      .collect();
    diff
  }
}

impl FromIterator<(String, String)> for ResourceManifest {
  fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// Key-level differences between two builds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
  pub added: Vec<String>,
  pub changed: Vec<String>,
  pub removed: Vec<String>,
  pub unchanged: Vec<String>,
}

/// Ordered list of resources that make up the application shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShellList(Vec<String>);

impl ShellList {
  pub fn new(keys: Vec<String>) -> Self {
    Self(keys)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Check that every shell key is listed in the manifest.
  pub fn validate(&self, manifest: &ResourceManifest) -> Result<()> {
    let missing: Vec<&str> = self.iter().filter(|k| !manifest.contains(k)).collect();
    if missing.is_empty() {
      Ok(())
    } else {
      Err(eyre!(
        "Shell resources missing from manifest: {}",
        missing.join(", ")
      ))
    }
  }
}
