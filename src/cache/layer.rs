//! Cache manager that owns the selected driver and orchestrates cache-first fetches.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::file::FileDriver;
use super::storage::SqliteDriver;
use super::traits::{CacheDriver, CacheEntry, CacheResult, Clock, DriverKind, SystemClock};
use crate::config::CacheConfig;

/// Resolve a driver by name and open it under `dir`.
///
/// An empty name selects the database driver; unknown names are a configuration error.
pub fn load_driver(name: &str, dir: &Path, clock: Arc<dyn Clock>) -> Result<Arc<dyn CacheDriver>> {
  let kind: DriverKind = name.parse()?;
  open_driver(kind, dir, clock)
}

fn open_driver(
  kind: DriverKind,
  dir: &Path,
  clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CacheDriver>> {
  debug!(driver = %kind, dir = %dir.display(), "opening cache driver");
  let driver: Arc<dyn CacheDriver> = match kind {
    DriverKind::Database => Arc::new(SqliteDriver::open(&dir.join("cache.db"), clock)?),
    DriverKind::File => Arc::new(FileDriver::new(dir.join("files"), clock)),
  };
  Ok(driver)
}

/// Stable, fixed-length storage key for a logical cache key.
pub fn hash_key(key: &str) -> String {
  hex::encode(Sha256::digest(key.as_bytes()))
}

/// Coerce arbitrary metadata into a JSON object.
pub fn normalize_info(info: Value) -> Map<String, Value> {
  match info {
    Value::Null => Map::new(),
    Value::Object(map) => map,
    other => {
      let mut map = Map::new();
      map.insert("value".to_string(), other);
      map
    }
  }
}

/// Facade over a single cache driver.
///
/// The driver is opened on first use and shared by every clone of the manager.
pub struct CacheManager {
  kind: DriverKind,
  dir: PathBuf,
  clock: Arc<dyn Clock>,
  default_ttl: Option<u64>,
  driver: Arc<Mutex<Option<Arc<dyn CacheDriver>>>>,
}

impl CacheManager {
  /// Create a manager for `kind` rooted at `dir`.
  pub fn new(kind: DriverKind, dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
    Self {
      kind,
      dir: dir.into(),
      clock,
      default_ttl: None,
      driver: Arc::new(Mutex::new(None)),
    }
  }

  /// Create a manager from the `cache` configuration section.
  pub fn from_config(config: &CacheConfig) -> Result<Self> {
    let dir = config.directory()?;
    Ok(Self::new(config.driver, dir, Arc::new(SystemClock)).with_default_ttl(config.default_ttl))
  }

  /// Wrap an already opened driver.
  pub fn with_driver(driver: Arc<dyn CacheDriver>) -> Self {
    Self {
      kind: driver.kind(),
      dir: PathBuf::new(),
      clock: Arc::new(SystemClock),
      default_ttl: None,
      driver: Arc::new(Mutex::new(Some(driver))),
    }
  }

  /// TTL applied by [`CacheManager::fetch`] when the caller passes none.
  pub fn with_default_ttl(mut self, ttl: Option<u64>) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn kind(&self) -> DriverKind {
    self.kind
  }

  fn driver(&self) -> Result<Arc<dyn CacheDriver>> {
    let mut guard = self
      .driver
      .lock()
      .map_err(|e| color_eyre::eyre::eyre!("Lock poisoned: {}", e))?;

    if let Some(driver) = guard.as_ref() {
      return Ok(Arc::clone(driver));
    }

    let driver = open_driver(self.kind, &self.dir, Arc::clone(&self.clock))?;
    // Expired entries from earlier runs are reclaimed once, on open
    match driver.prune() {
      Ok(removed) => debug!(driver = %self.kind, removed, "pruned cache on open"),
      Err(e) => warn!(driver = %self.kind, error = %e, "failed to prune cache on open"),
    }
    *guard = Some(Arc::clone(&driver));
    Ok(driver)
  }

  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.driver()?.get(&hash_key(key))
  }

  pub fn set(&self, key: &str, value: &[u8], ttl: Option<u64>, info: Value) -> Result<()> {
    self
      .driver()?
      .set(&hash_key(key), value, ttl, &normalize_info(info))
  }

  pub fn remove(&self, key: &str) -> Result<()> {
    self.driver()?.remove(&hash_key(key))
  }

  pub fn purge(&self) -> Result<()> {
    self.driver()?.purge()
  }

  pub fn prune(&self) -> Result<usize> {
    self.driver()?.prune()
  }

  /// Physical size of the backing storage in bytes.
  pub fn size(&self) -> Result<u64> {
    self.driver()?.size()
  }

  /// Read a cached JSON value. Undecodable entries read as missing.
  pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let Some(entry) = self.get(key)? else {
      return Ok(None);
    };

    match entry.json() {
      Ok(value) => Ok(Some(value)),
      Err(e) => {
        warn!(key, error = %e, "dropping undecodable cache entry");
        self.remove(key)?;
        Ok(None)
      }
    }
  }

  pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u64>) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    self.set(key, &bytes, ttl, Value::Null)
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Live cache entry: return it without calling `fetcher`
  /// 2. Otherwise fetch from network and write the result back with `ttl`
  ///
  /// Cache failures are logged and never fail the fetch.
  pub async fn fetch<T, E, F, Fut>(
    &self,
    key: &str,
    ttl: Option<u64>,
    fetcher: F,
  ) -> std::result::Result<CacheResult<T>, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
  {
    match self.get_json::<T>(key) {
      Ok(Some(data)) => {
        debug!(key, "cache hit");
        return Ok(CacheResult::from_cache(data));
      }
      Ok(None) => debug!(key, "cache miss"),
      Err(e) => warn!(key, error = %e, "cache read failed"),
    }

    let data = fetcher().await?;
    if let Err(e) = self.set_json(key, &data, ttl.or(self.default_ttl)) {
      warn!(key, error = %e, "cache write failed");
    }
    Ok(CacheResult::from_network(data))
  }
}

impl Clone for CacheManager {
  fn clone(&self) -> Self {
    Self {
      kind: self.kind,
      dir: self.dir.clone(),
      clock: Arc::clone(&self.clock),
      default_ttl: self.default_ttl,
      driver: Arc::clone(&self.driver),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::{CacheSource, Expiry, ManualClock};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn manager(kind: DriverKind, dir: &Path) -> (CacheManager, ManualClock) {
    let clock = ManualClock::new(1_700_000_000);
    (CacheManager::new(kind, dir, Arc::new(clock.clone())), clock)
  }

  #[test]
  fn test_load_driver_rejects_unknown_name() {
    let tmp = tempfile::tempdir().unwrap();
    let err = load_driver("memcached", tmp.path(), Arc::new(SystemClock))
      .err()
      .unwrap();
    assert!(err.to_string().contains("memcached"));

    let driver = load_driver("", tmp.path(), Arc::new(SystemClock)).unwrap();
    assert_eq!(driver.kind(), DriverKind::Database);
  }

  #[test]
  fn test_database_scenario_set_then_expire() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, clock) = manager(DriverKind::Database, tmp.path());

    cache.set("k1", b"hello", Some(60), json!({})).unwrap();
    let entry = cache.get("k1").unwrap().unwrap();
    assert_eq!(entry.value_str(), Some("hello"));
    assert_eq!(entry.expire, Expiry::At(1_700_000_060));
    assert!(entry.info.is_empty());

    clock.advance(61);
    assert!(cache.get("k1").unwrap().is_none());
  }

  #[test]
  fn test_contract_holds_for_both_drivers() {
    for kind in [DriverKind::Database, DriverKind::File] {
      let tmp = tempfile::tempdir().unwrap();
      let (cache, clock) = manager(kind, tmp.path());

      cache.set("a", b"v1", Some(10), json!(null)).unwrap();
      cache.set("a", b"v2", Some(10), json!("tag")).unwrap();
      let entry = cache.get("a").unwrap().unwrap();
      assert_eq!(entry.value, b"v2", "{kind}");
      assert_eq!(entry.info.get("value"), Some(&json!("tag")), "{kind}");

      cache.remove("a").unwrap();
      cache.remove("a").unwrap();
      assert!(cache.get("a").unwrap().is_none(), "{kind}");

      cache.set("b", b"1", None, json!({})).unwrap();
      cache.set("c", b"2", Some(5), json!({})).unwrap();
      clock.advance(5);
      assert!(cache.get("c").unwrap().is_none(), "{kind}");
      assert!(cache.get("b").unwrap().is_some(), "{kind}");

      cache.purge().unwrap();
      assert!(cache.get("b").unwrap().is_none(), "{kind}");
    }
  }

  #[test]
  fn test_normalize_info() {
    assert!(normalize_info(Value::Null).is_empty());
    assert_eq!(normalize_info(json!({"a": 1})).get("a"), Some(&json!(1)));
    assert_eq!(normalize_info(json!([1, 2])).get("value"), Some(&json!([1, 2])));
  }

  #[test]
  fn test_hash_key_is_stable_hex() {
    let hash = hash_key("users?page=1");
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, hash_key("users?page=1"));
    assert_ne!(hash, hash_key("users?page=2"));
  }

  #[tokio::test]
  async fn test_fetch_hits_cache_until_expiry() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, clock) = manager(DriverKind::File, tmp.path());
    let counter = AtomicUsize::new(0);
    let calls = &counter;

    let fetch = move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok::<_, String>(json!([{"id": 1}]))
    };

    let first = cache.fetch("users", Some(30), fetch).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = cache.fetch("users", Some(30), fetch).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data, json!([{"id": 1}]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(30);
    let third = cache.fetch("users", Some(30), fetch).await.unwrap();
    assert_eq!(third.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_fetch_error_is_not_cached() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, _) = manager(DriverKind::Database, tmp.path());

    let result: std::result::Result<CacheResult<Value>, String> = cache
      .fetch("k", Some(30), || async { Err("offline".to_string()) })
      .await;
    assert_eq!(result.unwrap_err(), "offline");
    assert!(cache.get("k").unwrap().is_none());
  }
}
