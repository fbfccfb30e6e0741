//! Rows of the `operation_queue` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Params, Row};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::queue::{OperationRecord, OperationStatus};

use super::{format_timestamp, parse_timestamp, Database};

const COLUMNS: &str = "seq, id, created_at, method, path, body, idempotency_key, extra_headers, \
                       attempts, last_error, next_attempt_at, status";

/// Number of records per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  pub pending: usize,
  pub failed: usize,
}

/// Row as stored, before decoding into an `OperationRecord`.
struct RawOperation {
  seq: i64,
  id: String,
  created_at: String,
  method: String,
  path: String,
  body: String,
  idempotency_key: Option<String>,
  extra_headers: String,
  attempts: u32,
  last_error: Option<String>,
  next_attempt_at: Option<String>,
  status: String,
}

impl RawOperation {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq: row.get(0)?,
      id: row.get(1)?,
      created_at: row.get(2)?,
      method: row.get(3)?,
      path: row.get(4)?,
      body: row.get(5)?,
      idempotency_key: row.get(6)?,
      extra_headers: row.get(7)?,
      attempts: row.get(8)?,
      last_error: row.get(9)?,
      next_attempt_at: row.get(10)?,
      status: row.get(11)?,
    })
  }

  fn into_record(self) -> Result<OperationRecord> {
    let extra_headers: BTreeMap<String, String> = serde_json::from_str(&self.extra_headers)
      .map_err(|e| Error::CorruptRecord(format!("{}: bad extra_headers: {}", self.id, e)))?;
    let body = serde_json::from_str(&self.body)
      .map_err(|e| Error::CorruptRecord(format!("{}: bad body: {}", self.id, e)))?;

    Ok(OperationRecord {
      seq: self.seq,
      created_at: parse_timestamp(&self.created_at)?,
      method: self
        .method
        .parse()
        .map_err(|_| Error::CorruptRecord(format!("{}: bad method '{}'", self.id, self.method)))?,
      path: self.path,
      body,
      idempotency_key: self.idempotency_key,
      extra_headers,
      attempts: self.attempts,
      last_error: self.last_error,
      next_attempt_at: self
        .next_attempt_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?,
      status: self.status.parse()?,
      id: self.id,
    })
  }
}

impl Database {
  /// Durably append a record and return its insertion sequence.
  pub fn append_operation(&self, record: &OperationRecord) -> Result<i64> {
    let body = serde_json::to_string(&record.body)?;
    let headers = serde_json::to_string(&record.extra_headers)?;

    let conn = self.conn()?;
    conn.execute(
      "INSERT INTO operation_queue
         (id, created_at, method, path, body, idempotency_key, extra_headers,
          attempts, last_error, next_attempt_at, status)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
      params![
        record.id,
        format_timestamp(&record.created_at),
        record.method.as_str(),
        record.path,
        body,
        record.idempotency_key,
        headers,
        record.attempts,
        record.last_error,
        record.next_attempt_at.as_ref().map(format_timestamp),
        record.status.as_str(),
      ],
    )?;

    Ok(conn.last_insert_rowid())
  }

  pub fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
    let conn = self.conn()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM operation_queue WHERE id = ?1", COLUMNS),
        params![id],
        RawOperation::from_row,
      )
      .optional()?;
    drop(conn);

    raw.map(RawOperation::into_record).transpose()
  }

  /// Pending records in replay order. With `due_at`, only records whose
  /// backoff has elapsed by then.
  pub fn pending_operations(&self, due_at: Option<DateTime<Utc>>) -> Result<Vec<OperationRecord>> {
    match due_at {
      Some(at) => self.select_operations(
        "status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)",
        params![format_timestamp(&at)],
      ),
      None => self.select_operations("status = 'pending'", []),
    }
  }

  /// Pending records still waiting out their backoff at `at`.
  pub fn deferred_count(&self, at: DateTime<Utc>) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM operation_queue
       WHERE status = 'pending' AND next_attempt_at > ?1",
      params![format_timestamp(&at)],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  /// Records parked for operator review, oldest first.
  pub fn failed_operations(&self) -> Result<Vec<OperationRecord>> {
    self.select_operations("status = 'failed_permanent'", [])
  }

  fn select_operations<P: Params>(&self, filter: &str, params: P) -> Result<Vec<OperationRecord>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM operation_queue WHERE {} ORDER BY created_at, seq",
      COLUMNS, filter
    ))?;
    let raws = stmt
      .query_map(params, RawOperation::from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);

    raws.into_iter().map(RawOperation::into_record).collect()
  }

  /// Record a retryable failure: bump attempts, keep the record pending.
  pub fn record_retry(
    &self,
    id: &str,
    error: &str,
    next_attempt_at: Option<DateTime<Utc>>,
  ) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn.execute(
      "UPDATE operation_queue
       SET attempts = attempts + 1, last_error = ?2, next_attempt_at = ?3
       WHERE id = ?1 AND status = 'pending'",
      params![id, error, next_attempt_at.as_ref().map(format_timestamp)],
    )?;
    Ok(changed > 0)
  }

  /// Park a record as `failed_permanent`, counting the failed attempt.
  pub fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn.execute(
      "UPDATE operation_queue
       SET attempts = attempts + 1, last_error = ?2, next_attempt_at = NULL,
           status = 'failed_permanent'
       WHERE id = ?1 AND status = 'pending'",
      params![id, error],
    )?;
    Ok(changed > 0)
  }

  /// Delete a record that the remote has applied.
  pub fn remove_operation(&self, id: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn.execute("DELETE FROM operation_queue WHERE id = ?1", params![id])?;
    Ok(changed > 0)
  }

  /// Operator action: drop a failed record. Pending records are never touched.
  pub fn acknowledge_failed(&self, id: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn.execute(
      "DELETE FROM operation_queue WHERE id = ?1 AND status = 'failed_permanent'",
      params![id],
    )?;
    Ok(changed > 0)
  }

  /// Operator action: put a failed record back in line with a fresh attempt count.
  pub fn requeue_operation(&self, id: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn.execute(
      "UPDATE operation_queue
       SET status = 'pending', attempts = 0, next_attempt_at = NULL
       WHERE id = ?1 AND status = 'failed_permanent'",
      params![id],
    )?;
    Ok(changed > 0)
  }

  pub fn queue_counts(&self) -> Result<QueueCounts> {
    let conn = self.conn()?;
    let (pending, failed): (i64, i64) = conn.query_row(
      "SELECT
         COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
         COALESCE(SUM(CASE WHEN status = 'failed_permanent' THEN 1 ELSE 0 END), 0)
       FROM operation_queue",
      [],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(QueueCounts {
      pending: pending as usize,
      failed: failed as usize,
    })
  }
}
