//! Directory-backed cache driver.
//!
//! Entry metadata lives in a small JSON property file (`index.json`); each payload is
//! stored in its own file. The directory is created on first access, and the first
//! access also sweeps out entries that expired while the process was not running.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::traits::{CacheDriver, CacheEntry, Clock, DriverKind, Expiry};

const INDEX_FILE: &str = "index.json";
const PAYLOAD_DIR: &str = "blobs";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
  expire: i64,
  #[serde(default)]
  info: Map<String, Value>,
}

type Index = BTreeMap<String, IndexEntry>;

/// Cache driver storing one payload file per hash.
pub struct FileDriver {
  dir: PathBuf,
  clock: Arc<dyn Clock>,
  /// Loaded on first access
  index: Mutex<Option<Index>>,
}

impl FileDriver {
  /// Create a driver rooted at `dir`. Nothing touches the disk until first use.
  pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
    Self {
      dir: dir.into(),
      clock,
      index: Mutex::new(None),
    }
  }

  fn index_path(&self) -> PathBuf {
    self.dir.join(INDEX_FILE)
  }

  fn payload_path(&self, hash: &str) -> PathBuf {
    let name = hex::encode(Sha256::digest(hash.as_bytes()));
    self.dir.join(PAYLOAD_DIR).join(name)
  }

  /// Lock the index, creating the directories and loading it on first access.
  fn index(&self) -> Result<MutexGuard<'_, Option<Index>>> {
    let mut guard = self
      .index
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if guard.is_none() {
      std::fs::create_dir_all(self.dir.join(PAYLOAD_DIR))
        .map_err(|e| eyre!("Failed to create cache directory {}: {}", self.dir.display(), e))?;

      let mut index = self.load_index()?;
      let swept = self.sweep(&mut index);
      if swept > 0 {
        self.save_index(&index)?;
      }
      debug!(dir = %self.dir.display(), entries = index.len(), swept, "loaded file cache");
      *guard = Some(index);
    }

    Ok(guard)
  }

  fn load_index(&self) -> Result<Index> {
    let path = self.index_path();
    if !path.exists() {
      return Ok(Index::new());
    }

    let bytes = std::fs::read(&path)
      .map_err(|e| eyre!("Failed to read cache index {}: {}", path.display(), e))?;

    match serde_json::from_slice(&bytes) {
      Ok(index) => Ok(index),
      Err(e) => {
        // Payloads without metadata are unreachable; start over
        warn!(path = %path.display(), error = %e, "corrupt cache index, resetting");
        Ok(Index::new())
      }
    }
  }

  fn save_index(&self, index: &Index) -> Result<()> {
    let path = self.index_path();
    let tmp = path.with_extension("json.tmp");
    let bytes =
      serde_json::to_vec(index).map_err(|e| eyre!("Failed to encode cache index: {}", e))?;

    std::fs::write(&tmp, bytes)
      .map_err(|e| eyre!("Failed to write cache index {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &path)
      .map_err(|e| eyre!("Failed to replace cache index {}: {}", path.display(), e))?;

    Ok(())
  }

  /// Apply `update` to a copy of `index` and persist it. The in-memory index only
  /// changes once the copy is on disk.
  fn commit<R>(&self, index: &mut Index, update: impl FnOnce(&mut Index) -> R) -> Result<R> {
    let mut updated = index.clone();
    let out = update(&mut updated);
    self.save_index(&updated)?;
    *index = updated;
    Ok(out)
  }

  /// Drop expired entries and their payloads from `index`.
  fn sweep(&self, index: &mut Index) -> usize {
    let now = self.clock.now();
    let expired: Vec<String> = index
      .iter()
      .filter(|(_, entry)| Expiry::from_raw(entry.expire).is_expired(now))
      .map(|(hash, _)| hash.clone())
      .collect();

    for hash in &expired {
      index.remove(hash);
      delete_file(&self.payload_path(hash));
    }

    expired.len()
  }
}

/// Remove a file, ignoring a missing one.
fn delete_file(path: &Path) {
  if let Err(e) = std::fs::remove_file(path) {
    if e.kind() != std::io::ErrorKind::NotFound {
      warn!(path = %path.display(), error = %e, "failed to delete cache payload");
    }
  }
}

impl CacheDriver for FileDriver {
  fn get(&self, hash: &str) -> Result<Option<CacheEntry>> {
    let mut guard = self.index()?;
    let Some(index) = guard.as_mut() else {
      return Ok(None);
    };

    let Some(meta) = index.get(hash).cloned() else {
      return Ok(None);
    };

    let expire = Expiry::from_raw(meta.expire);
    let path = self.payload_path(hash);

    if expire.is_expired(self.clock.now()) {
      debug!(hash, "cache entry expired");
      self.commit(index, |index| index.remove(hash))?;
      delete_file(&path);
      return Ok(None);
    }

    let value = match std::fs::read(&path) {
      Ok(value) => value,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        warn!(hash, "cache payload missing, dropping entry");
        self.commit(index, |index| index.remove(hash))?;
        return Ok(None);
      }
      Err(e) => return Err(eyre!("Failed to read cache payload {}: {}", path.display(), e)),
    };

    Ok(Some(CacheEntry {
      hash: hash.to_string(),
      value,
      expire,
      info: meta.info,
    }))
  }

  fn set(
    &self,
    hash: &str,
    value: &[u8],
    ttl: Option<u64>,
    info: &Map<String, Value>,
  ) -> Result<()> {
    let mut guard = self.index()?;
    let Some(index) = guard.as_mut() else {
      return Err(eyre!("Cache index not loaded"));
    };

    let path = self.payload_path(hash);
    std::fs::write(&path, value)
      .map_err(|e| eyre!("Failed to write cache payload {}: {}", path.display(), e))?;

    let entry = IndexEntry {
      expire: Expiry::from_ttl(self.clock.now(), ttl).to_raw(),
      info: info.clone(),
    };
    if let Err(e) = self.commit(index, |index| index.insert(hash.to_string(), entry)) {
      delete_file(&path);
      return Err(e);
    }
    Ok(())
  }

  fn remove(&self, hash: &str) -> Result<()> {
    let mut guard = self.index()?;
    let Some(index) = guard.as_mut() else {
      return Ok(());
    };

    if index.contains_key(hash) {
      self.commit(index, |index| index.remove(hash))?;
    }
    delete_file(&self.payload_path(hash));
    Ok(())
  }

  fn purge(&self) -> Result<()> {
    let mut guard = self.index()?;
    let Some(index) = guard.as_mut() else {
      return Ok(());
    };

    let dropped = self.commit(index, |index| std::mem::take(index))?;
    for hash in dropped.keys() {
      delete_file(&self.payload_path(hash));
    }
    Ok(())
  }

  fn prune(&self) -> Result<usize> {
    let mut guard = self.index()?;
    let Some(index) = guard.as_mut() else {
      return Ok(0);
    };

    let now = self.clock.now();
    let expired: Vec<String> = index
      .iter()
      .filter(|(_, entry)| Expiry::from_raw(entry.expire).is_expired(now))
      .map(|(hash, _)| hash.clone())
      .collect();
    if expired.is_empty() {
      return Ok(0);
    }

    self.commit(index, |index| {
      for hash in &expired {
        index.remove(hash);
      }
    })?;
    for hash in &expired {
      delete_file(&self.payload_path(hash));
    }
    Ok(expired.len())
  }

  fn size(&self) -> Result<u64> {
    let guard = self.index()?;
    let Some(index) = guard.as_ref() else {
      return Ok(0);
    };

    let mut total = 0;
    for hash in index.keys() {
      if let Ok(meta) = std::fs::metadata(self.payload_path(hash)) {
        total += meta.len();
      }
    }
    Ok(total)
  }

  fn kind(&self) -> DriverKind {
    DriverKind::File
  }
}
