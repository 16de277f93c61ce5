//! SQLite-backed cache driver.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::traits::{CacheDriver, CacheEntry, Clock, DriverKind, Expiry};
use crate::db::{schema::CACHE_SCHEMA, Database};

/// Cache driver keeping one row per hash in a SQLite table.
pub struct SqliteDriver {
  db: Database,
  clock: Arc<dyn Clock>,
}

impl SqliteDriver {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
    let db = Database::try_open(path, CACHE_SCHEMA)
      .ok_or_else(|| eyre!("Cache database unavailable at {}", path.display()))?;
    Ok(Self { db, clock })
  }

  /// Cache that lives only as long as this driver.
  pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
    let db = Database::open_in_memory(CACHE_SCHEMA)?;
    Ok(Self { db, clock })
  }
}

impl CacheDriver for SqliteDriver {
  fn get(&self, hash: &str) -> Result<Option<CacheEntry>> {
    let row: Option<(Vec<u8>, i64, String)> =
      self.db.with_conn("Failed to read cache entry", |conn| {
        conn
          .query_row(
            "SELECT value, expire, info FROM cache WHERE hash = ?",
            params![hash],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
          )
          .optional()
      })?;

    let Some((value, expire, info)) = row else {
      return Ok(None);
    };

    let expire = Expiry::from_raw(expire);
    if expire.is_expired(self.clock.now()) {
      debug!(hash, "cache entry expired");
      self.remove(hash)?;
      return Ok(None);
    }

    let info: Map<String, Value> =
      serde_json::from_str(&info).map_err(|e| eyre!("Failed to decode cache info: {}", e))?;

    Ok(Some(CacheEntry {
      hash: hash.to_string(),
      value,
      expire,
      info,
    }))
  }

  fn set(
    &self,
    hash: &str,
    value: &[u8],
    ttl: Option<u64>,
    info: &Map<String, Value>,
  ) -> Result<()> {
    let expire = Expiry::from_ttl(self.clock.now(), ttl).to_raw();
    let info =
      serde_json::to_string(info).map_err(|e| eyre!("Failed to encode cache info: {}", e))?;

    self.db.with_conn("Failed to store cache entry", |conn| {
      conn.execute(
        "INSERT OR REPLACE INTO cache (hash, value, expire, info) VALUES (?, ?, ?, ?)",
        params![hash, value, expire, info],
      )
    })?;

    Ok(())
  }

  fn remove(&self, hash: &str) -> Result<()> {
    self.db.with_conn("Failed to remove cache entry", |conn| {
      conn.execute("DELETE FROM cache WHERE hash = ?", params![hash])
    })?;
    Ok(())
  }

  fn purge(&self) -> Result<()> {
    self.db.with_conn("Failed to purge cache", |conn| {
      conn.execute("DELETE FROM cache", [])
    })?;
    Ok(())
  }

  fn prune(&self) -> Result<usize> {
    let now = self.clock.now();
    let removed = self.db.with_conn("Failed to prune cache", |conn| {
      conn.execute(
        "DELETE FROM cache WHERE expire >= 0 AND expire <= ?",
        params![now],
      )
    })?;
    debug!(removed, "pruned expired cache entries");
    Ok(removed)
  }

  fn size(&self) -> Result<u64> {
    self.db.size()
  }

  fn kind(&self) -> DriverKind {
    DriverKind::Database
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::ManualClock;

  fn driver() -> (SqliteDriver, ManualClock) {
    let clock = ManualClock::new(1_000);
    let driver = SqliteDriver::in_memory(Arc::new(clock.clone())).unwrap();
    (driver, clock)
  }

  #[test]
  fn test_ttl_expires_at_boundary() {
    let (driver, clock) = driver();
    driver.set("k1", b"hello", Some(60), &Map::new()).unwrap();

    clock.advance(59);
    let entry = driver.get("k1").unwrap().unwrap();
    assert_eq!(entry.value_str(), Some("hello"));
    assert_eq!(entry.expire, Expiry::At(1_060));

    clock.advance(1);
    assert!(driver.get("k1").unwrap().is_none());
  }

  #[test]
  fn test_expired_row_is_reclaimed_on_read() {
    let (driver, clock) = driver();
    driver.set("k", b"v", Some(1), &Map::new()).unwrap();
    clock.advance(5);
    assert!(driver.get("k").unwrap().is_none());

    let rows: i64 = driver
      .db
      .with_conn("count", |conn| {
        conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
      })
      .unwrap();
    assert_eq!(rows, 0);
  }

  #[test]
  fn test_overwrite_replaces_value_and_info() {
    let (driver, _) = driver();
    let mut info = Map::new();
    info.insert("etag".into(), Value::from("a"));
    driver.set("k", b"v1", Some(10), &info).unwrap();
    driver.set("k", b"v2", None, &Map::new()).unwrap();

    let entry = driver.get("k").unwrap().unwrap();
    assert_eq!(entry.value, b"v2");
    assert_eq!(entry.expire, Expiry::Never);
    assert!(entry.info.is_empty());
  }

  #[test]
  fn test_remove_twice_is_ok() {
    let (driver, _) = driver();
    driver.set("k", b"v", None, &Map::new()).unwrap();
    driver.remove("k").unwrap();
    driver.remove("k").unwrap();
    assert!(driver.get("k").unwrap().is_none());
  }

  #[test]
  fn test_purge_and_prune() {
    let (driver, clock) = driver();
    driver.set("a", b"1", Some(10), &Map::new()).unwrap();
    driver.set("b", b"2", None, &Map::new()).unwrap();
    driver.set("c", b"3", Some(100), &Map::new()).unwrap();

    clock.advance(50);
    assert_eq!(driver.prune().unwrap(), 1);
    assert!(driver.get("b").unwrap().is_some());
    assert!(driver.get("c").unwrap().is_some());

    driver.purge().unwrap();
    for key in ["a", "b", "c"] {
      assert!(driver.get(key).unwrap().is_none());
    }
    assert!(driver.size().unwrap() > 0);
  }
}
