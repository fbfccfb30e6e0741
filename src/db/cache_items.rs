//! Rows of the `cache_items` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::cache::CacheEntry;
use crate::error::{Error, Result};

use super::{format_timestamp, parse_timestamp, Database};

impl Database {
  pub fn get_cache_item(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;
    let row: Option<(String, String)> = conn
      .query_row(
        "SELECT payload, updated_at FROM cache_items WHERE key = ?1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;
    drop(conn);

    match row {
      Some((payload, updated_at)) => {
        let payload: Value = serde_json::from_str(&payload)
          .map_err(|e| Error::CorruptRecord(format!("cache item '{}': {}", key, e)))?;
        Ok(Some(CacheEntry {
          key: key.to_string(),
          payload,
          updated_at: parse_timestamp(&updated_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  /// Upsert; the last write wins.
  pub fn put_cache_item(&self, key: &str, payload: &Value, updated_at: DateTime<Utc>) -> Result<()> {
    let payload = serde_json::to_string(payload)?;
    let conn = self.conn()?;
    conn.execute(
      "INSERT INTO cache_items (key, payload, updated_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
      params![key, payload, format_timestamp(&updated_at)],
    )?;
    Ok(())
  }

  pub fn delete_cache_item(&self, key: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn.execute("DELETE FROM cache_items WHERE key = ?1", params![key])?;
    Ok(changed > 0)
  }

  pub fn cache_keys(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT key FROM cache_items ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(keys)
  }
}
