//! Durable operation queue and idempotent replay.
//!
//! Every side-effecting action is enqueued first, online or not, and only
//! reported as accepted once the record is in the local store. `flush`
//! replays pending records in creation order and classifies each outcome:
//!
//! | outcome                  | effect                                  |
//! |--------------------------|-----------------------------------------|
//! | 2xx                      | removed, counted as processed           |
//! | 409                      | already applied: removed, processed     |
//! | transport failure, 5xx   | attempts+1, backoff, stays pending      |
//! | other 4xx                | parked as `failed_permanent`            |
//!
//! A stuck record never blocks the ones behind it. Ordering between two
//! operations is therefore best-effort across passes; operations that must be
//! applied together have to be enqueued as one request.

mod types;

use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::{ApiResponse, HttpMethod, Remote, IDEMPOTENCY_KEY_HEADER};
use crate::db::{Database, QueueCounts};
use crate::error::{Error, Result, TransportError};
use crate::idempotency;

pub use types::{FlushReport, OperationRecord, OperationStatus, RetryPolicy};

/// What a single replay attempt means for the queued record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
  Applied,
  /// 409: the remote already processed this idempotency key
  AlreadyApplied,
  Retry(String),
  Reject(String),
}

fn classify(outcome: std::result::Result<ApiResponse, TransportError>) -> Disposition {
  let response = match outcome {
    Ok(response) => response,
    Err(e) => return Disposition::Retry(e.to_string()),
  };

  match response.into_result() {
    Ok(_) => Disposition::Applied,
    Err(Error::RemoteConflict { .. }) => Disposition::AlreadyApplied,
    Err(e) if e.is_retryable() => Disposition::Retry(e.to_string()),
    Err(e) => Disposition::Reject(e.to_string()),
  }
}

/// Durable FIFO of pending operations against the remote `R`.
pub struct OperationQueue<R: Remote> {
  db: Arc<Database>,
  remote: R,
  policy: RetryPolicy,
  /// Held for the whole of a flush pass
  flush_guard: Mutex<()>,
  abort_requested: AtomicBool,
}

impl<R: Remote> OperationQueue<R> {
  pub fn new(db: Arc<Database>, remote: R, policy: RetryPolicy) -> Self {
    Self {
      db,
      remote,
      policy,
      flush_guard: Mutex::new(()),
      abort_requested: AtomicBool::new(false),
    }
  }

  pub fn db(&self) -> &Arc<Database> {
    &self.db
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// Validate, key and durably store an operation.
  ///
  /// Mutating methods get an idempotency key derived from the method, path
  /// and body, unless the caller supplied an `Idempotency-Key` header. The
  /// record is returned only once it is in the store.
  pub fn enqueue(
    &self,
    method: HttpMethod,
    path: &str,
    body: Value,
    headers: BTreeMap<String, String>,
  ) -> Result<OperationRecord> {
    validate_path(path)?;
    if !method.is_mutating() && !body.is_null() {
      return Err(Error::Validation(format!("{} requests cannot carry a body", method)));
    }
    validate_headers(&headers)?;

    let (explicit_key, extra_headers): (Vec<_>, Vec<_>) = headers
      .into_iter()
      .partition(|(name, _)| name.eq_ignore_ascii_case(IDEMPOTENCY_KEY_HEADER));

    let idempotency_key = match explicit_key.into_iter().next() {
      Some((_, key)) if key.trim().is_empty() => {
        return Err(Error::Validation("empty Idempotency-Key header".to_string()))
      }
      Some((_, key)) => Some(key),
      None if method.is_mutating() => Some(idempotency::derive(
        &format!("{} {}", method, path),
        &body,
      )),
      None => None,
    };

    let mut record = OperationRecord {
      id: uuid::Uuid::new_v4().to_string(),
      seq: 0,
      created_at: Utc::now(),
      method,
      path: path.to_string(),
      body,
      idempotency_key,
      extra_headers: extra_headers.into_iter().collect(),
      attempts: 0,
      last_error: None,
      next_attempt_at: None,
      status: OperationStatus::Pending,
    };

    record.seq = self.db.append_operation(&record).map_err(|e| {
      error!(method = %record.method, path = %record.path, error = %e, "failed to persist operation");
      e
    })?;

    info!(
      id = %record.id,
      method = %record.method,
      path = %record.path,
      "operation queued"
    );
    Ok(record)
  }

  /// Replay every due pending record once.
  ///
  /// Returns `Error::FlushInProgress` without doing anything if another pass
  /// holds the guard. Per-record failures are written to the record and do
  /// not stop the pass; only a storage failure does.
  pub async fn flush(&self) -> Result<FlushReport> {
    let _guard = self
      .flush_guard
      .try_lock()
      .map_err(|_| Error::FlushInProgress)?;

    let result = self.replay_due().await;
    // A request to abort only applies to the pass it stopped (or the next one)
    self.abort_requested.store(false, Ordering::SeqCst);
    result
  }

  async fn replay_due(&self) -> Result<FlushReport> {
    let started = Utc::now();
    let due = self.db.pending_operations(Some(started))?;

    let mut report = FlushReport {
      deferred: self.db.deferred_count(started)?,
      ..FlushReport::default()
    };

    for record in due {
      if self.abort_requested.load(Ordering::SeqCst) {
        info!("flush aborted between records");
        report.aborted = true;
        break;
      }

      debug!(id = %record.id, method = %record.method, path = %record.path, attempt = record.attempts + 1, "replaying operation");
      let outcome = self.remote.execute(&record.to_request()).await;

      match classify(outcome) {
        Disposition::Applied => {
          self.db.remove_operation(&record.id)?;
          report.processed += 1;
        }
        Disposition::AlreadyApplied => {
          debug!(id = %record.id, "remote reports operation already applied");
          self.db.remove_operation(&record.id)?;
          report.processed += 1;
        }
        Disposition::Retry(reason) => {
          if self.record_retry(&record, &reason)? {
            report.failed += 1;
          }
        }
        Disposition::Reject(reason) => {
          error!(id = %record.id, path = %record.path, reason = %reason, "operation rejected, parked for review");
          self.db.mark_failed(&record.id, &reason)?;
          report.failed += 1;
        }
      }
    }

    report.remaining = self.db.queue_counts()?.pending;
    info!(
      processed = report.processed,
      remaining = report.remaining,
      failed = report.failed,
      deferred = report.deferred,
      aborted = report.aborted,
      "flush finished"
    );
    Ok(report)
  }

  /// Returns true when the failure exhausted the retry budget.
  fn record_retry(&self, record: &OperationRecord, reason: &str) -> Result<bool> {
    let attempts = record.attempts + 1;

    if self.policy.exhausted(attempts) {
      let message = format!("retry limit reached: {}", reason);
      error!(id = %record.id, attempts, reason = %reason, "giving up on operation, parked for review");
      self.db.mark_failed(&record.id, &message)?;
      return Ok(true);
    }

    let delay = self.policy.delay_for(attempts);
    let next_attempt_at = if delay.is_zero() {
      None
    } else {
      chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
    };

    warn!(id = %record.id, attempts, reason = %reason, retry_in_secs = delay.as_secs(), "operation will be retried");
    if !self.db.record_retry(&record.id, reason, next_attempt_at)? {
      debug!(id = %record.id, "record changed during replay, retry not recorded");
    }
    Ok(false)
  }

  /// Ask an active flush to stop before its next record. Called while no
  /// pass is running, it stops the next pass before its first record.
  pub fn abort(&self) {
    self.abort_requested.store(true, Ordering::SeqCst);
  }

  pub fn get(&self, id: &str) -> Result<Option<OperationRecord>> {
    self.db.get_operation(id)
  }

  pub fn pending(&self) -> Result<Vec<OperationRecord>> {
    self.db.pending_operations(None)
  }

  pub fn failed(&self) -> Result<Vec<OperationRecord>> {
    self.db.failed_operations()
  }

  pub fn counts(&self) -> Result<QueueCounts> {
    self.db.queue_counts()
  }

  /// Operator acknowledgement: discard a `failed_permanent` record.
  pub fn acknowledge(&self, id: &str) -> Result<()> {
    if self.db.acknowledge_failed(id)? {
      info!(id, "failed operation acknowledged and removed");
      Ok(())
    } else {
      Err(Error::NotFound(id.to_string()))
    }
  }

  /// Operator retry: move a `failed_permanent` record back to pending.
  pub fn requeue(&self, id: &str) -> Result<()> {
    if self.db.requeue_operation(id)? {
      info!(id, "failed operation requeued");
      Ok(())
    } else {
      Err(Error::NotFound(id.to_string()))
    }
  }
}

fn validate_path(path: &str) -> Result<()> {
  if !path.starts_with('/') || path.starts_with("//") {
    return Err(Error::Validation(format!(
      "path must be relative to the API root and start with '/': '{}'",
      path
    )));
  }
  if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
    return Err(Error::Validation(format!("path contains whitespace: '{}'", path)));
  }
  Ok(())
}

fn validate_headers(headers: &BTreeMap<String, String>) -> Result<()> {
  for (name, value) in headers {
    HeaderName::from_bytes(name.as_bytes())
      .map_err(|_| Error::Validation(format!("invalid header name '{}'", name)))?;
    HeaderValue::from_str(value)
      .map_err(|_| Error::Validation(format!("invalid value for header '{}'", name)))?;
  }
  Ok(())
}
