pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{Connection, Params, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Shared SQLite connection used by the cache driver and the offline mirror.
pub struct Database {
  conn: Mutex<Connection>,
  path: Option<PathBuf>,
}

impl Database {
  /// Open or create the database at `path` and run the given schema.
  pub fn open(path: &Path, schema: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self {
      conn: Mutex::new(conn),
      path: Some(path.to_path_buf()),
    };
    db.run_migrations(schema)?;
    debug!(path = %path.display(), "opened database");

    Ok(db)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory(schema: &str) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    let db = Self {
      conn: Mutex::new(conn),
      path: None,
    };
    db.run_migrations(schema)?;
    Ok(db)
  }

  /// Like [`Database::open`], but reports failure as `None` instead of an error.
  ///
  /// Callers must check the result before use; the failure is logged here.
  pub fn try_open(path: &Path, schema: &str) -> Option<Self> {
    match Self::open(path, schema) {
      Ok(db) => Some(db),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "database unavailable");
        None
      }
    }
  }

  /// Get the default data directory for persisted state.
  pub fn default_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("modelsync"))
  }

  fn run_migrations(&self, schema: &str) -> Result<()> {
    self
      .lock()?
      .execute_batch(schema)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection for a sequence of statements.
  pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run a closure against the connection, mapping SQLite errors with `context`.
  pub fn with_conn<T, F>(&self, context: &str, f: F) -> Result<T>
  where
    F: FnOnce(&Connection) -> rusqlite::Result<T>,
  {
    let conn = self.lock()?;
    f(&conn).map_err(|e| eyre!("{}: {}", context, e))
  }

  /// Visit each row of a query once, front to back.
  ///
  /// The visitor sees rows in cursor order and cannot rewind.
  pub fn each_row<P, F>(&self, sql: &str, params: P, mut visit: F) -> Result<()>
  where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<()>,
  {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let mut rows = stmt
      .query(params)
      .map_err(|e| eyre!("Failed to run query: {}", e))?;

    while let Some(row) = rows.next().map_err(|e| eyre!("Failed to read row: {}", e))? {
      visit(row).map_err(|e| eyre!("Failed to decode row: {}", e))?;
    }

    Ok(())
  }

  /// Physical size of the backing store in bytes.
  pub fn size(&self) -> Result<u64> {
    if let Some(path) = &self.path {
      let meta = std::fs::metadata(path)
        .map_err(|e| eyre!("Failed to stat database {}: {}", path.display(), e))?;
      return Ok(meta.len());
    }

    self.with_conn("Failed to read page statistics", |conn| {
      let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
      let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
      Ok((pages * page_size).max(0) as u64)
    })
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_each_row_visits_in_order() {
    let db = Database::open_in_memory("CREATE TABLE t (n INTEGER);").unwrap();
    db.with_conn("insert", |conn| {
      for n in 1..=3 {
        conn.execute("INSERT INTO t (n) VALUES (?)", [n])?;
      }
      Ok(())
    })
    .unwrap();

    let mut seen = Vec::new();
    db.each_row("SELECT n FROM t ORDER BY n", [], |row| {
      seen.push(row.get::<_, i64>(0)?);
      Ok(())
    })
    .unwrap();

    assert_eq!(seen, vec![1, 2, 3]);
  }

  #[test]
  fn test_try_open_returns_none_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be opened as a database file
    assert!(Database::try_open(dir.path(), schema::CACHE_SCHEMA).is_none());
  }

  #[test]
  fn test_file_size_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let db = Database::open(&path, schema::CACHE_SCHEMA).unwrap();
    assert!(db.size().unwrap() > 0);
    assert_eq!(db.path(), Some(path.as_path()));
  }
}
