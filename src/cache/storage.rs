//! Cache storage trait and SQLite implementation.
//!
//! Stores are named key→response maps. `open` is idempotent: two handles on
//! the same name read and write the same rows.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::traits::CachedEntry;
use crate::error::{ProxyError, ProxyResult};
use crate::http::{Headers, Response, ResponseType};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Create the store if it does not exist.
  fn open_store(&self, name: &str) -> ProxyResult<()>;

  fn has_store(&self, name: &str) -> ProxyResult<bool>;

  /// Store names in creation order.
  fn list_stores(&self) -> ProxyResult<Vec<String>>;

  /// Delete a store and all of its entries. Returns false if it did not exist.
  fn delete_store(&self, name: &str) -> ProxyResult<bool>;

  fn get(&self, store: &str, key: &str) -> ProxyResult<Option<CachedEntry>>;

  /// Replace the entry for `key`. Fails if the store is gone or the quota
  /// would be exceeded.
  fn put(&self, store: &str, key: &str, response: &Response) -> ProxyResult<()>;

  fn keys(&self, store: &str) -> ProxyResult<Vec<String>>;

  /// Evict least recently used entries until the store fits in `max_bytes`.
  /// Keys in `keep` are never evicted but still count toward the budget.
  /// Returns the number of evicted entries.
  fn trim(&self, store: &str, max_bytes: u64, keep: &[String]) -> ProxyResult<usize>;
}

/// Entry point to the named stores, shared by every component of a
/// generation.
#[derive(Clone)]
pub struct Caches {
  storage: Arc<dyn CacheStorage>,
}

impl Caches {
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn open(&self, name: &str) -> ProxyResult<Store> {
    self.storage.open_store(name)?;
    Ok(Store {
      name: name.to_string(),
      storage: Arc::clone(&self.storage),
    })
  }

  /// Handle on a store without creating it. Writes fail once the store has
  /// been deleted.
  pub fn handle(&self, name: &str) -> Store {
    Store {
      name: name.to_string(),
      storage: Arc::clone(&self.storage),
    }
  }

  pub fn has(&self, name: &str) -> ProxyResult<bool> {
    self.storage.has_store(name)
  }

  pub fn list(&self) -> ProxyResult<Vec<String>> {
    self.storage.list_stores()
  }

  pub fn delete(&self, name: &str) -> ProxyResult<bool> {
    self.storage.delete_store(name)
  }

  /// Look `key` up in each named store in order, returning the first hit.
  /// Stores that do not exist are skipped.
  pub fn match_any(&self, stores: &[String], key: &str) -> ProxyResult<Option<CachedEntry>> {
    for name in stores {
      if !self.storage.has_store(name)? {
        continue;
      }
      if let Some(entry) = self.storage.get(name, key)? {
        return Ok(Some(entry));
      }
    }
    Ok(None)
  }
}

/// Handle on a single named store.
#[derive(Clone)]
pub struct Store {
  name: String,
  storage: Arc<dyn CacheStorage>,
}

impl Store {
  pub fn get(&self, key: &str) -> ProxyResult<Option<CachedEntry>> {
    self.storage.get(&self.name, key)
  }

  pub fn put(&self, key: &str, response: &Response) -> ProxyResult<()> {
    self.storage.put(&self.name, key, response)
  }

  pub fn keys(&self) -> ProxyResult<Vec<String>> {
    self.storage.keys(&self.name)
  }

  pub fn trim(&self, max_bytes: u64, keep: &[String]) -> ProxyResult<usize> {
    self.storage.trim(&self.name, max_bytes, keep)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  /// Total body bytes allowed across all stores
  quota_bytes: Option<u64>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Private database that disappears with the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
    self.quota_bytes = quota_bytes;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("outpost").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock().map_err(|e| eyre!("{}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> ProxyResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| ProxyError::store(format!("lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per request identity; writes replace the whole row
CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    size INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    access_seq INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (store, key)
);

CREATE INDEX IF NOT EXISTS idx_entries_access ON entries(store, access_seq);
"#;

const NEXT_ACCESS_SEQ: &str = "(SELECT COALESCE(MAX(access_seq), 0) + 1 FROM entries)";

impl CacheStorage for SqliteStorage {
  fn open_store(&self, name: &str) -> ProxyResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO stores (name) VALUES (?)",
      params![name],
    )?;
    Ok(())
  }

  fn has_store(&self, name: &str) -> ProxyResult<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  fn list_stores(&self) -> ProxyResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM stores ORDER BY rowid")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_store(&self, name: &str) -> ProxyResult<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE store = ?", params![name])?;
    let removed = tx.execute("DELETE FROM stores WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn get(&self, store: &str, key: &str) -> ProxyResult<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, kind, headers, body, cached_at FROM entries
         WHERE store = ? AND key = ?",
        params![store, key],
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
      .optional()?;

    let Some((status, kind, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    conn.execute(
      &format!(
        "UPDATE entries SET access_seq = {} WHERE store = ? AND key = ?",
        NEXT_ACCESS_SEQ
      ),
      params![store, key],
    )?;

    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| ProxyError::store(format!("corrupt headers for {}: {}", key, e)))?;

    Ok(Some(CachedEntry {
      key: key.to_string(),
      response: Response {
        status,
        headers,
        body,
        kind: parse_kind(&kind),
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> ProxyResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM stores WHERE name = ?",
        params![store],
        |row| row.get(0),
      )
      .optional()?;
    if exists.is_none() {
      return Err(ProxyError::store(format!("store {} does not exist", store)));
    }

    let size = response.body.len() as u64;
    if let Some(quota) = self.quota_bytes {
      let used: i64 = tx.query_row(
        "SELECT COALESCE(SUM(size), 0) FROM entries WHERE NOT (store = ? AND key = ?)",
        params![store, key],
        |row| row.get(0),
      )?;
      if used as u64 + size > quota {
        return Err(ProxyError::store(format!(
          "quota exceeded writing {} ({} bytes, {} of {} in use)",
          key, size, used, quota
        )));
      }
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| ProxyError::store(format!("failed to serialize headers: {}", e)))?;

    tx.execute(
      &format!(
        "INSERT OR REPLACE INTO entries
           (store, key, status, kind, headers, body, size, cached_at, access_seq)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'), {})",
        NEXT_ACCESS_SEQ
      ),
      params![
        store,
        key,
        response.status,
        kind_str(response.kind),
        headers,
        response.body,
        size as i64
      ],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn keys(&self, store: &str) -> ProxyResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM entries WHERE store = ? ORDER BY key")?;
    let keys = stmt
      .query_map(params![store], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn trim(&self, store: &str, max_bytes: u64, keep: &[String]) -> ProxyResult<usize> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let rows: Vec<(String, i64)> = {
      let mut stmt = tx.prepare(
        "SELECT key, size FROM entries WHERE store = ? ORDER BY access_seq DESC",
      )?;
      let rows = stmt
        .query_map(params![store], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
      rows
    };

    let (pinned, rows): (Vec<_>, Vec<_>) =
      rows.into_iter().partition(|(key, _)| keep.contains(key));

    // Keep the most recently used prefix that fits, evict everything older
    let mut kept: u64 = pinned.iter().map(|(_, size)| *size as u64).sum();
    let mut evicted = 0;
    let mut full = false;
    for (key, size) in rows {
      let size = size as u64;
      if !full && kept + size <= max_bytes {
        kept += size;
        continue;
      }
      full = true;
      tx.execute(
        "DELETE FROM entries WHERE store = ? AND key = ?",
        params![store, key],
      )?;
      evicted += 1;
    }
    tx.commit()?;

    if evicted > 0 {
      debug!(store, evicted, kept_bytes = kept, "Trimmed store");
    }
    Ok(evicted)
  }
}

fn kind_str(kind: ResponseType) -> &'static str {
  match kind {
    ResponseType::Basic => "basic",
    ResponseType::Cors => "cors",
    ResponseType::Opaque => "opaque",
    ResponseType::Default => "default",
  }
}

fn parse_kind(s: &str) -> ResponseType {
  match s {
    "basic" => ResponseType::Basic,
    "cors" => ResponseType::Cors,
    "opaque" => ResponseType::Opaque,
    _ => ResponseType::Default,
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> ProxyResult<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| ProxyError::store(format!("failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn caches() -> Caches {
    Caches::new(SqliteStorage::open_in_memory().unwrap())
  }

  fn body(len: usize) -> Response {
    Response::text("x".repeat(len))
  }

  #[test]
  fn test_open_is_idempotent_and_shares_entries() {
    let caches = caches();
    let a = caches.open("outpost-standard-dynamic-v1").unwrap();
    let b = caches.open("outpost-standard-dynamic-v1").unwrap();

    a.put("GET https://app.example/", &Response::html("<p>hi</p>"))
      .unwrap();

    let entry = b.get("GET https://app.example/").unwrap().unwrap();
    assert_eq!(entry.response.body_text(), "<p>hi</p>");
    assert_eq!(caches.list().unwrap().len(), 1);
  }

  #[test]
  fn test_put_replaces_whole_entry() {
    let caches = caches();
    let store = caches.open("s").unwrap();
    store
      .put("k", &Response::text("old").with_header("x-old", "1"))
      .unwrap();
    store.put("k", &Response::text("new")).unwrap();

    let entry = store.get("k").unwrap().unwrap();
    assert_eq!(entry.response.body_text(), "new");
    assert_eq!(entry.response.headers.get("x-old"), None);
  }

  #[test]
  fn test_list_in_creation_order_and_delete() {
    let caches = caches();
    caches.open("b").unwrap();
    caches.open("a").unwrap();
    assert_eq!(caches.list().unwrap(), vec!["b", "a"]);

    assert!(caches.delete("b").unwrap());
    assert!(!caches.delete("b").unwrap());
    assert_eq!(caches.list().unwrap(), vec!["a"]);
  }

  #[test]
  fn test_delete_drops_entries() {
    let caches = caches();
    let store = caches.open("s").unwrap();
    store.put("k", &Response::text("v")).unwrap();
    caches.delete("s").unwrap();

    let reopened = caches.open("s").unwrap();
    assert!(reopened.get("k").unwrap().is_none());
  }

  #[test]
  fn test_put_into_deleted_store_fails() {
    let caches = caches();
    let store = caches.open("s").unwrap();
    caches.delete("s").unwrap();

    let err = store.put("k", &Response::text("v")).unwrap_err();
    assert!(matches!(err, ProxyError::StoreUnavailable(_)));
    assert!(caches.list().unwrap().is_empty());
  }

  #[test]
  fn test_quota_exceeded_is_store_unavailable() {
    let caches = Caches::new(
      SqliteStorage::open_in_memory()
        .unwrap()
        .with_quota(Some(100)),
    );
    let store = caches.open("s").unwrap();
    store.put("a", &body(60)).unwrap();

    let err = store.put("b", &body(60)).unwrap_err();
    assert!(matches!(err, ProxyError::StoreUnavailable(_)));

    // Replacing an entry only counts the new size
    store.put("a", &body(90)).unwrap();
  }

  #[test]
  fn test_match_any_checks_stores_in_order() {
    let caches = caches();
    let first = caches.open("first").unwrap();
    let second = caches.open("second").unwrap();
    first.put("k", &Response::text("first")).unwrap();
    second.put("k", &Response::text("second")).unwrap();
    second.put("only", &Response::text("second")).unwrap();

    let names = vec!["missing".to_string(), "first".into(), "second".into()];
    let hit = caches.match_any(&names, "k").unwrap().unwrap();
    assert_eq!(hit.response.body_text(), "first");
    assert!(caches.match_any(&names, "only").unwrap().is_some());
    assert!(caches.match_any(&names, "nope").unwrap().is_none());
    assert!(!caches.has("missing").unwrap());
  }

  #[test]
  fn test_trim_evicts_least_recently_used() {
    let caches = caches();
    let store = caches.open("s").unwrap();
    store.put("a", &body(40)).unwrap();
    store.put("b", &body(40)).unwrap();
    store.put("c", &body(40)).unwrap();

    // Touch "a" so "b" becomes the oldest
    store.get("a").unwrap();

    let evicted = store.trim(80, &[]).unwrap();
    assert_eq!(evicted, 1);
    assert_eq!(store.keys().unwrap(), vec!["a", "c"]);
  }

  #[test]
  fn test_trim_never_evicts_kept_keys() {
    let caches = caches();
    let store = caches.open("s").unwrap();
    store.put("snapshot", &body(40)).unwrap();
    store.put("a", &body(40)).unwrap();
    store.put("b", &body(40)).unwrap();

    // "snapshot" is the oldest entry but is kept, and its size still counts
    let evicted = store.trim(80, &["snapshot".to_string()]).unwrap();
    assert_eq!(evicted, 1);
    assert_eq!(store.keys().unwrap(), vec!["b", "snapshot"]);

    // Even a budget smaller than the kept entry leaves it in place
    store.trim(10, &["snapshot".to_string()]).unwrap();
    assert_eq!(store.keys().unwrap(), vec!["snapshot"]);
  }

  #[test]
  fn test_round_trips_response_metadata() {
    let caches = caches();
    let store = caches.open("s").unwrap();
    let resp = Response::new(404, "application/json", "{}").with_kind(ResponseType::Basic);
    store.put("k", &resp).unwrap();

    let entry = store.get("k").unwrap().unwrap();
    assert_eq!(entry.response, resp);
    assert_eq!(entry.key, "k");
  }
}
