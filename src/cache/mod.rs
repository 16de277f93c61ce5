//! Key-value cache with per-entry expiry.
//!
//! - Two interchangeable drivers: SQLite (`database`) and a directory of files (`file`)
//! - Keys are hashed before they reach a driver
//! - Expired entries are never returned; they are reclaimed on read or by `prune`
//! - `CacheManager::fetch` serves a live entry or runs the fetcher and stores its result

mod file;
mod layer;
mod storage;
mod traits;

pub use file::FileDriver;
pub use layer::{hash_key, load_driver, normalize_info, CacheManager};
pub use storage::SqliteDriver;
pub use traits::{
  CacheDriver, CacheEntry, CacheResult, CacheSource, Clock, DriverKind, Expiry, ManualClock,
  SystemClock, NEVER_EXPIRES,
};
