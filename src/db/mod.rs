//! Durable local store.
//!
//! A single SQLite database owns every piece of persisted client state: the
//! operation queue, cached reference data and a small metadata table. Each
//! mutating call is one statement or one transaction, so an interrupted
//! process never leaves a half-written or duplicated row behind.

mod cache_items;
mod operations;
pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Error, Result};

pub use operations::QueueCounts;

/// Handle to the local store.
///
/// Constructed once at startup and shared by reference (usually in an `Arc`)
/// with the queue, the cache and the orchestrator.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`, creating parent directories.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened local store");
    Self::from_connection(conn)
  }

  /// Open a private in-memory database. Nothing survives the handle.
  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("tillsync").join("tillsync.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;
    conn.execute_batch(schema::SCHEMA)?;
    conn.execute(
      "INSERT OR IGNORE INTO meta (key, value, updated_at) VALUES ('schema_version', ?1, ?2)",
      params![schema::SCHEMA_VERSION.to_string(), format_timestamp(&Utc::now())],
    )?;
    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| Error::LockPoisoned)
  }

  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    let value = conn
      .query_row(
        "SELECT value FROM meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  pub fn put_meta(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT INTO meta (key, value, updated_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
      params![key, value, format_timestamp(&Utc::now())],
    )?;
    Ok(())
  }

  pub fn delete_meta(&self, key: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
    Ok(changed > 0)
  }

  /// Stable identifier for this install, created on first use.
  pub fn device_id(&self) -> Result<String> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO meta (key, value, updated_at) VALUES ('device_id', ?1, ?2)",
      params![
        uuid::Uuid::new_v4().to_string(),
        format_timestamp(&Utc::now())
      ],
    )?;
    let id: String = tx.query_row(
      "SELECT value FROM meta WHERE key = 'device_id'",
      [],
      |row| row.get(0),
    )?;
    tx.commit()?;
    Ok(id)
  }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::CorruptRecord(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_schema_setup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    let db = Database::open(&path).unwrap();
    db.put_meta("greeting", "hello").unwrap();
    drop(db);

    // Reopening runs the schema again without clobbering data
    let db = Database::open(&path).unwrap();
    assert_eq!(db.get_meta("greeting").unwrap().as_deref(), Some("hello"));
    assert_eq!(
      db.get_meta("schema_version").unwrap(),
      Some(schema::SCHEMA_VERSION.to_string())
    );
  }

  #[test]
  fn test_meta_put_get_delete() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.get_meta("last_flush_at").unwrap(), None);

    db.put_meta("last_flush_at", "a").unwrap();
    db.put_meta("last_flush_at", "b").unwrap();
    assert_eq!(db.get_meta("last_flush_at").unwrap().as_deref(), Some("b"));

    assert!(db.delete_meta("last_flush_at").unwrap());
    assert!(!db.delete_meta("last_flush_at").unwrap());
    assert_eq!(db.get_meta("last_flush_at").unwrap(), None);
  }

  #[test]
  fn test_device_id_is_stable() {
    let db = Database::open_in_memory().unwrap();
    let first = db.device_id().unwrap();
    assert_eq!(db.device_id().unwrap(), first);
  }

  #[test]
  fn test_timestamps_sort_as_text() {
    let earlier = "2026-01-02T03:04:05.000001Z";
    let later = format_timestamp(&parse_timestamp("2026-01-02T03:04:05.1Z").unwrap());
    assert!(earlier < later.as_str());
    assert_eq!(later, "2026-01-02T03:04:05.100000Z");
  }
}
