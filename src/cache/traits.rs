//! Core traits and types for the caching system.

use chrono::Utc;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::ConfigError;

/// Raw value persisted for entries that never expire.
pub const NEVER_EXPIRES: i64 = -1;

/// Expiration of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
  Never,
  /// Unix timestamp (seconds) from which the entry reads as missing
  At(i64),
}

impl Expiry {
  /// Compute the expiration for a TTL given in seconds. `None` never expires.
  pub fn from_ttl(now: i64, ttl: Option<u64>) -> Self {
    match ttl {
      Some(secs) => Self::At(i64::try_from(secs).map_or(i64::MAX, |s| now.saturating_add(s))),
      None => Self::Never,
    }
  }

  pub fn from_raw(raw: i64) -> Self {
    if raw < 0 {
      Self::Never
    } else {
      Self::At(raw)
    }
  }

  pub fn to_raw(self) -> i64 {
    match self {
      Self::Never => NEVER_EXPIRES,
      Self::At(ts) => ts,
    }
  }

  pub fn is_expired(self, now: i64) -> bool {
    match self {
      Self::Never => false,
      Self::At(ts) => now >= ts,
    }
  }
}

/// A single entry read back from a cache driver.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  /// Key identifying the entry
  pub hash: String,
  pub value: Vec<u8>,
  pub expire: Expiry,
  /// Arbitrary metadata stored next to the value
  pub info: Map<String, Value>,
}

impl CacheEntry {
  /// The value as UTF-8 text, if it is text.
  pub fn value_str(&self) -> Option<&str> {
    std::str::from_utf8(&self.value).ok()
  }

  /// Decode the value as JSON.
  pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.value)
  }
}

/// Persistent key to blob storage with TTL.
///
/// Expired entries must read as missing even if they are still physically present.
pub trait CacheDriver: Send + Sync {
  /// Get a live entry. Expired entries are reclaimed and reported as `None`.
  fn get(&self, hash: &str) -> Result<Option<CacheEntry>>;

  /// Insert or overwrite the entry for `hash`. A `None` TTL never expires.
  fn set(&self, hash: &str, value: &[u8], ttl: Option<u64>, info: &Map<String, Value>)
    -> Result<()>;

  /// Remove an entry. Removing a missing entry is not an error.
  fn remove(&self, hash: &str) -> Result<()>;

  /// Delete every entry.
  fn purge(&self) -> Result<()>;

  /// Delete expired entries, returning how many were removed.
  fn prune(&self) -> Result<usize>;

  /// Physical footprint of the backing storage in bytes.
  fn size(&self) -> Result<u64>;

  fn kind(&self) -> DriverKind;
}

/// Available cache backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
  /// One table row per entry in SQLite
  #[default]
  Database,
  /// JSON property index plus one payload file per entry
  File,
}

impl DriverKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Database => "database",
      Self::File => "file",
    }
  }
}

impl FromStr for DriverKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.trim() {
      "" | "database" => Ok(Self::Database),
      "file" => Ok(Self::File),
      other => Err(ConfigError::UnknownDriver(other.to_string())),
    }
  }
}

impl fmt::Display for DriverKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Source of unix time for expiry checks.
pub trait Clock: Send + Sync {
  fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> i64 {
    Utc::now().timestamp()
  }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
  pub fn new(start: i64) -> Self {
    Self(Arc::new(AtomicI64::new(start)))
  }

  pub fn advance(&self, secs: i64) {
    self.0.fetch_add(secs, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> i64 {
    self.0.load(Ordering::SeqCst)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from a live cache entry.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  #[default]
  Network,
  /// Live entry from the cache
  Cache,
  /// Local offline mirror
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expiry_boundary() {
    let expiry = Expiry::from_ttl(100, Some(60));
    assert_eq!(expiry, Expiry::At(160));
    assert!(!expiry.is_expired(159));
    assert!(expiry.is_expired(160));
  }

  #[test]
  fn test_huge_ttl_saturates_instead_of_wrapping() {
    for ttl in [u64::MAX, 1 << 63] {
      let expiry = Expiry::from_ttl(100, Some(ttl));
      assert_eq!(expiry, Expiry::At(i64::MAX));
      assert!(!expiry.is_expired(100));
      assert_ne!(Expiry::from_raw(expiry.to_raw()), Expiry::Never);
    }
  }

  #[test]
  fn test_never_sentinel_roundtrip() {
    assert_eq!(Expiry::from_ttl(100, None).to_raw(), NEVER_EXPIRES);
    assert_eq!(Expiry::from_raw(NEVER_EXPIRES), Expiry::Never);
    assert!(!Expiry::Never.is_expired(i64::MAX));
  }

  #[test]
  fn test_driver_kind_parse() {
    assert_eq!("".parse::<DriverKind>().unwrap(), DriverKind::Database);
    assert_eq!("file".parse::<DriverKind>().unwrap(), DriverKind::File);
    assert_eq!(
      "redis".parse::<DriverKind>().unwrap_err(),
      ConfigError::UnknownDriver("redis".into())
    );
  }

  #[test]
  fn test_manual_clock_shared() {
    let clock = ManualClock::new(10);
    let other = clock.clone();
    clock.advance(5);
    assert_eq!(other.now(), 15);
  }
}
