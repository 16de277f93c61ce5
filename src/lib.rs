//! Model synchronization over REST-style backends, with a TTL cache and an offline mirror.

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod sync;

pub use engine::SyncEngine;
pub use error::{ConfigError, SyncError};
