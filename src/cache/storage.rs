//! Cache store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey, Response};

/// Trait for cache store backends.
///
/// A store holds any number of named partitions. Every method is a single
/// atomic operation; callers compose them into longer sequences themselves.
pub trait CacheStore: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn ensure_partition(&self, name: &str) -> Result<()>;

  fn has_partition(&self, name: &str) -> Result<bool>;

  /// Delete a partition and everything in it. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  fn get_entry(&self, partition: &str, request: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous entry for the same request.
  fn put_entry(&self, partition: &str, request: &RequestKey, response: &Response) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn delete_entry(&self, partition: &str, request: &RequestKey) -> Result<bool>;

  /// All request identities stored in a partition.
  fn entry_keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  /// Open (lazily creating) a partition and return a handle to it.
  fn open<'a>(&'a self, name: &'a str) -> Result<Partition<'a, Self>>
  where
    Self: Sized,
  {
    self.ensure_partition(name)?;
    Ok(Partition { store: self, name })
  }
}

/// Handle to one named partition of a store.
pub struct Partition<'a, S: CacheStore> {
  store: &'a S,
  name: &'a str,
}

impl<'a, S: CacheStore> Partition<'a, S> {
  pub fn get(&self, request: &RequestKey) -> Result<Option<CachedResponse>> {
    self.store.get_entry(self.name, request)
  }

  pub fn put(&self, request: &RequestKey, response: &Response) -> Result<()> {
    self.store.put_entry(self.name, request, response)
  }

  pub fn delete(&self, request: &RequestKey) -> Result<bool> {
    self.store.delete_entry(self.name, request)
  }

  pub fn keys(&self) -> Result<Vec<RequestKey>> {
    self.store.entry_keys(self.name)
  }
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the given path, or at the default location.
  pub fn open_at(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Count entries per partition, for status reporting.
  pub fn entry_counts(&self) -> Result<Vec<(String, usize)>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT p.name, COUNT(e.url) FROM partitions p
         LEFT JOIN entries e ON e.partition = p.name
         GROUP BY p.name ORDER BY p.name",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let counts = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to count entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry counts: {}", e))?;

    Ok(
      counts
        .into_iter()
        .map(|(name, n)| (name, n.max(0) as usize))
        .collect(),
    )
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    body_sha256 TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, method, url)
);

CREATE INDEX IF NOT EXISTS idx_entries_partition ON entries(partition);
"#;

impl CacheStore for SqliteStore {
  fn ensure_partition(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;

    Ok(())
  }

  fn has_partition(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM partitions WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up partition {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get_entry(&self, partition: &str, request: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(i64, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, headers, body, body_sha256, cached_at FROM entries
         WHERE partition = ? AND method = ? AND url = ?",
        params![partition, request.method, request.url.as_str()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", request, partition, e))?;

    let Some((status, headers, body, digest, cached_at)) = row else {
      return Ok(None);
    };

    if body_digest(&body) != digest {
      return Err(eyre!(
        "Corrupt cache entry {} in {}: body digest mismatch",
        request,
        partition
      ));
    }

    let status = u16::try_from(status)
      .map_err(|_| eyre!("Invalid stored status {} for {}", status, request))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", request, e))?;

    Ok(Some(CachedResponse {
      response: Response {
        status,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put_entry(&self, partition: &str, request: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers for {}: {}", request, e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Writing into a deleted partition recreates it, matching open-on-demand
    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (partition, method, url, status, headers, body, body_sha256, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        request.method,
        request.url.as_str(),
        response.status,
        headers,
        response.body,
        body_digest(&response.body),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", request, partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete_entry(&self, partition: &str, request: &RequestKey) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM entries WHERE partition = ? AND method = ? AND url = ?",
        params![partition, request.method, request.url.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete {} from {}: {}", request, partition, e))?;

    Ok(removed > 0)
  }

  fn entry_keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE partition = ? ORDER BY url, method")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![partition], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entries of {}: {}", partition, e))?;

    rows
      .iter()
      .map(|(method, url)| RequestKey::from_parts(method, url))
      .collect()
  }
}

/// Hex-encoded SHA-256 of a response body.
fn body_digest(body: &[u8]) -> String {
  hex::encode(Sha256::digest(body))
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request(path: &str) -> RequestKey {
    RequestKey::get(Url::parse("https://app.test/").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_open_creates_partition_lazily() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(!store.has_partition("live").unwrap());

    let live = store.open("live").unwrap();
    assert!(store.has_partition("live").unwrap());
    assert!(live.keys().unwrap().is_empty());
  }

  #[test]
  fn test_put_get_replace() {
    let store = SqliteStore::open_in_memory().unwrap();
    let live = store.open("live").unwrap();
    let req = request("main.js");

    live
      .put(&req, &Response::new(200, "v1").with_header("Content-Type", "text/javascript"))
      .unwrap();
    live.put(&req, &Response::new(200, "v2")).unwrap();

    let cached = live.get(&req).unwrap().unwrap();
    assert_eq!(cached.response.body, b"v2");
    assert!(cached.response.headers.is_empty());
    assert_eq!(live.keys().unwrap(), vec![req]);
  }

  #[test]
  fn test_headers_survive_storage() {
    let store = SqliteStore::open_in_memory().unwrap();
    let live = store.open("live").unwrap();
    let req = request("index.html");

    live
      .put(&req, &Response::new(200, "<html>").with_header("Content-Type", "text/html"))
      .unwrap();

    let cached = live.get(&req).unwrap().unwrap();
    assert_eq!(cached.response.header("content-type"), Some("text/html"));
  }

  #[test]
  fn test_partitions_are_isolated() {
    let store = SqliteStore::open_in_memory().unwrap();
    let staging = store.open("staging").unwrap();
    let live = store.open("live").unwrap();
    let req = request("main.js");

    staging.put(&req, &Response::new(200, "staged")).unwrap();

    assert!(live.get(&req).unwrap().is_none());
    assert_eq!(
      staging.get(&req).unwrap().unwrap().response.body,
      b"staged"
    );
  }

  #[test]
  fn test_delete_entry() {
    let store = SqliteStore::open_in_memory().unwrap();
    let live = store.open("live").unwrap();
    let req = request("main.js");

    live.put(&req, &Response::new(200, "x")).unwrap();
    assert!(live.delete(&req).unwrap());
    assert!(!live.delete(&req).unwrap());
    assert!(live.get(&req).unwrap().is_none());
  }

  #[test]
  fn test_delete_partition_removes_entries() {
    let store = SqliteStore::open_in_memory().unwrap();
    let req = request("main.js");
    store
      .open("staging")
      .unwrap()
      .put(&req, &Response::new(200, "x"))
      .unwrap();

    assert!(store.delete_partition("staging").unwrap());
    assert!(!store.delete_partition("staging").unwrap());
    assert!(!store.has_partition("staging").unwrap());

    // Reopening yields an empty partition
    let staging = store.open("staging").unwrap();
    assert!(staging.keys().unwrap().is_empty());
  }

  #[test]
  fn test_entry_counts() {
    let store = SqliteStore::open_in_memory().unwrap();
    let live = store.open("live").unwrap();
    store.open("staging").unwrap();
    live.put(&request("a.js"), &Response::new(200, "a")).unwrap();
    live.put(&request("b.js"), &Response::new(200, "b")).unwrap();

    assert_eq!(
      store.entry_counts().unwrap(),
      vec![("live".to_string(), 2), ("staging".to_string(), 0)]
    );
  }

  #[test]
  fn test_corrupt_body_is_rejected() {
    let store = SqliteStore::open_in_memory().unwrap();
    let live = store.open("live").unwrap();
    let req = request("main.js");
    live.put(&req, &Response::new(200, "original")).unwrap();

    {
      let conn = store.conn.lock().unwrap();
      conn
        .execute("UPDATE entries SET body = ?", params![b"tampered".to_vec()])
        .unwrap();
    }

    let err = live.get(&req).unwrap_err();
    assert!(err.to_string().contains("digest mismatch"));
  }

  #[test]
  fn test_persists_across_reopen() {
    let dir = std::env::temp_dir().join(format!("shellcache-test-{}", std::process::id()));
    let path = dir.join("cache.db");
    let _ = std::fs::remove_file(&path);
    let req = request("main.js");

    {
      let store = SqliteStore::open_at(Some(&path)).unwrap();
      store
        .open("live")
        .unwrap()
        .put(&req, &Response::new(200, "kept"))
        .unwrap();
    }

    let store = SqliteStore::open_at(Some(&path)).unwrap();
    let cached = store.open("live").unwrap().get(&req).unwrap().unwrap();
    assert_eq!(cached.response.body, b"kept");

    let _ = std::fs::remove_dir_all(&dir);
  }
}
