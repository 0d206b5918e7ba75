//! Mapping between request URLs and logical manifest keys.

use color_eyre::{eyre::eyre, Result};
use url::Url;

use crate::cache::RequestKey;
use crate::manifest::ROOT_KEY;

/// Fixed key under which the previous build's manifest is stored.
const MANIFEST_ENTRY: &str = "manifest";

/// Query marker used by the front end for cache-busting revalidation.
const VERSION_QUERY: &str = "?v=";

/// The origin the worker serves. Logical keys are URLs relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
  root: Url,
  /// ASCII serialization without trailing slash, e.g. `https://app.test`
  prefix: String,
}

impl Origin {
  pub fn parse(input: &str) -> Result<Self> {
    let url = Url::parse(input).map_err(|e| eyre!("Invalid origin '{}': {}", input, e))?;
    Self::from_url(&url)
  }

  pub fn from_url(url: &Url) -> Result<Self> {
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be http or https, got {}", url));
    }

    let origin = url.origin();
    if !origin.is_tuple() {
      return Err(eyre!("URL has no usable origin: {}", url));
    }

    let prefix = origin.ascii_serialization();
    let root = Url::parse(&format!("{}/", prefix))
      .map_err(|e| eyre!("Invalid origin '{}': {}", prefix, e))?;

    Ok(Self { root, prefix })
  }

  #[cfg(test)]
  pub fn as_str(&self) -> &str {
    &self.prefix
  }

  /// Resolve a logical key to the absolute URL it is fetched from. Keys
  /// that land on another origin are rejected.
  pub fn resolve(&self, key: &str) -> Result<Url> {
    if key == ROOT_KEY {
      return Ok(self.root.clone());
    }
    let url = self
      .root
      .join(key)
      .map_err(|e| eyre!("Invalid resource key '{}': {}", key, e))?;
    if self.relative(&url).is_none() {
      return Err(eyre!("Resource key '{}' resolves outside origin {}", key, self.prefix));
    }
    Ok(url)
  }

  /// GET request identity for a logical key.
  pub fn request_for(&self, key: &str) -> Result<RequestKey> {
    self.resolve(key).map(RequestKey::get)
  }

  /// Request identity of the stored manifest.
  pub fn manifest_request(&self) -> Result<RequestKey> {
    self.request_for(MANIFEST_ENTRY)
  }

  /// Logical key of a stored entry: the origin-relative remainder of its URL,
  /// with the empty remainder meaning the root. `None` for foreign URLs.
  pub fn stored_key(&self, url: &Url) -> Option<String> {
    let rest = self.relative(url)?;
    if rest.is_empty() {
      Some(ROOT_KEY.to_string())
    } else {
      Some(rest.to_string())
    }
  }

  /// Logical key of an intercepted request. Like [`Origin::stored_key`], but
  /// also drops a `?v=` revalidation suffix and maps fragment-only URLs to
  /// the root.
  pub fn request_key(&self, url: &Url) -> Option<String> {
    let rest = self.relative(url)?;
    let rest = match rest.find(VERSION_QUERY) {
      Some(pos) => &rest[..pos],
      None => rest,
    };

    if rest.is_empty() || rest.starts_with('#') {
      Some(ROOT_KEY.to_string())
    } else {
      Some(rest.to_string())
    }
  }

  /// URL text after `<origin>/`, or `None` if the URL is not same-origin.
  fn relative<'a>(&self, url: &'a Url) -> Option<&'a str> {
    let rest = url.as_str().strip_prefix(self.prefix.as_str())?;
    if rest.is_empty() {
      return Some(rest);
    }
    rest.strip_prefix('/')
  }
}

impl std::fmt::Display for Origin {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.prefix)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Origin {
    Origin::parse("https://app.test").unwrap()
  }

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_origin_normalizes_to_scheme_and_host() {
    let o = Origin::parse("https://app.test/some/path?q=1").unwrap();
    assert_eq!(o.as_str(), "https://app.test");

    let with_port = Origin::parse("http://localhost:8080/").unwrap();
    assert_eq!(with_port.as_str(), "http://localhost:8080");
  }

  #[test]
  fn test_origin_rejects_non_http() {
    assert!(Origin::parse("file:///tmp/app").is_err());
    assert!(Origin::parse("not a url").is_err());
  }

  #[test]
  fn test_resolve() {
    let o = origin();
    assert_eq!(o.resolve("/").unwrap().as_str(), "https://app.test/");
    assert_eq!(
      o.resolve("assets/FontManifest.json").unwrap().as_str(),
      "https://app.test/assets/FontManifest.json"
    );
    assert_eq!(
      o.manifest_request().unwrap().url.as_str(),
      "https://app.test/manifest"
    );
  }

  #[test]
  fn test_resolve_rejects_foreign_keys() {
    let o = origin();
    for key in ["https://cdn.test/x.js", "//cdn.test/x.js", "http://app.test/x.js"] {
      let err = o.resolve(key).unwrap_err();
      assert!(err.to_string().contains("outside origin"), "{}", key);
    }
    // Absolute URLs on the same origin are fine
    assert_eq!(
      o.resolve("https://app.test/x.js").unwrap().as_str(),
      "https://app.test/x.js"
    );
  }

  #[test]
  fn test_stored_key() {
    let o = origin();
    assert_eq!(o.stored_key(&url("https://app.test")), Some("/".into()));
    assert_eq!(o.stored_key(&url("https://app.test/")), Some("/".into()));
    assert_eq!(
      o.stored_key(&url("https://app.test/main.js")),
      Some("main.js".into())
    );
    assert_eq!(
      o.stored_key(&url("https://app.test/main.js?v=3")),
      Some("main.js?v=3".into())
    );
  }

  #[test]
  fn test_stored_key_foreign_url() {
    let o = origin();
    assert_eq!(o.stored_key(&url("https://cdn.test/main.js")), None);
    assert_eq!(o.stored_key(&url("https://app.test.evil/main.js")), None);
    assert_eq!(o.stored_key(&url("http://app.test/main.js")), None);
  }

  #[test]
  fn test_request_key_strips_version_query() {
    let o = origin();
    assert_eq!(
      o.request_key(&url("https://app.test/main.js?v=12345")),
      Some("main.js".into())
    );
    assert_eq!(
      o.request_key(&url("https://app.test/?v=12345")),
      Some("/".into())
    );
    // Other queries are part of the key
    assert_eq!(
      o.request_key(&url("https://app.test/main.js?x=1")),
      Some("main.js?x=1".into())
    );
  }

  #[test]
  fn test_request_key_root_forms() {
    let o = origin();
    assert_eq!(o.request_key(&url("https://app.test")), Some("/".into()));
    assert_eq!(o.request_key(&url("https://app.test/")), Some("/".into()));
    assert_eq!(
      o.request_key(&url("https://app.test/#/settings")),
      Some("/".into())
    );
    assert_eq!(
      o.request_key(&url("https://app.test/index.html")),
      Some("index.html".into())
    );
  }
}
