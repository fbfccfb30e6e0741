use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::api::{ApiRequest, HttpMethod, IDEMPOTENCY_KEY_HEADER};
use crate::error::Error;

/// Lifecycle state of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
  Pending,
  Completed,
  /// Rejected by the remote or out of retries; waits for an operator
  FailedPermanent,
}

impl OperationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationStatus::Pending => "pending",
      OperationStatus::Completed => "completed",
      OperationStatus::FailedPermanent => "failed_permanent",
    }
  }
}

impl fmt::Display for OperationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OperationStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(OperationStatus::Pending),
      "completed" => Ok(OperationStatus::Completed),
      "failed_permanent" => Ok(OperationStatus::FailedPermanent),
      other => Err(Error::CorruptRecord(format!("unknown status '{}'", other))),
    }
  }
}

/// A queued side-effecting request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
  pub id: String,
  /// Insertion sequence assigned by the store
  pub seq: i64,
  pub created_at: DateTime<Utc>,
  pub method: HttpMethod,
  pub path: String,
  /// `Null` when the request has no body
  pub body: Value,
  pub idempotency_key: Option<String>,
  pub extra_headers: BTreeMap<String, String>,
  pub attempts: u32,
  pub last_error: Option<String>,
  /// Earliest time the record is due again after a retryable failure
  pub next_attempt_at: Option<DateTime<Utc>>,
  pub status: OperationStatus,
}

impl OperationRecord {
  /// Build the request replayed against the remote.
  pub fn to_request(&self) -> ApiRequest {
    let mut headers: BTreeMap<String, String> = self
      .extra_headers
      .iter()
      .filter(|(name, _)| !name.eq_ignore_ascii_case(IDEMPOTENCY_KEY_HEADER))
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    if let Some(key) = &self.idempotency_key {
      headers.insert(IDEMPOTENCY_KEY_HEADER.to_string(), key.clone());
    }

    ApiRequest {
      method: self.method,
      path: self.path.clone(),
      body: (!self.body.is_null()).then(|| self.body.clone()),
      headers,
    }
  }
}

/// Backoff and attempt ceiling for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Delay after the first failure; doubled for each further failure
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Failed attempts after which a retryable record is parked as
  /// `failed_permanent`. `None` retries forever.
  pub max_attempts: Option<u32>,
}

impl RetryPolicy {
  /// No backoff and no ceiling: every pending record is due on every pass.
  pub fn immediate() -> Self {
    Self {
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
      max_attempts: None,
    }
  }

  /// Delay before the next attempt, given the number of failures so far.
  pub fn delay_for(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    let exponent = (attempts - 1).min(31);
    self
      .base_delay
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  pub fn exhausted(&self, attempts: u32) -> bool {
    self.max_attempts.is_some_and(|max| attempts >= max)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(300),
      max_attempts: Some(25),
    }
  }
}

/// Aggregate result of one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
  /// Records applied or recognized as already applied, and removed
  pub processed: usize,
  /// Pending records left in the store after the pass
  pub remaining: usize,
  /// Records that became failed_permanent during this pass
  pub failed: usize,
  /// Pending records skipped because their backoff had not elapsed
  pub deferred: usize,
  /// The pass stopped early because an abort was requested
  pub aborted: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record() -> OperationRecord {
    OperationRecord {
      id: "op-1".to_string(),
      seq: 1,
      created_at: Utc::now(),
      method: HttpMethod::Post,
      path: "/stock/adjust".to_string(),
      body: json!({"sku": "A1"}),
      idempotency_key: Some("abc".to_string()),
      extra_headers: BTreeMap::from([
        ("X-Register".to_string(), "3".to_string()),
        ("idempotency-key".to_string(), "stale".to_string()),
      ]),
      attempts: 0,
      last_error: None,
      next_attempt_at: None,
      status: OperationStatus::Pending,
    }
  }

  #[test]
  fn test_request_carries_stored_key() {
    let request = record().to_request();
    assert_eq!(request.idempotency_key(), Some("abc"));
    assert_eq!(request.headers.get("X-Register").map(String::as_str), Some("3"));
    assert_eq!(request.headers.len(), 2);
    assert_eq!(request.body, Some(json!({"sku": "A1"})));
  }

  #[test]
  fn test_null_body_is_omitted() {
    let mut rec = record();
    rec.body = Value::Null;
    assert_eq!(rec.to_request().body, None);
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(60),
      max_attempts: None,
    };
    assert_eq!(policy.delay_for(0), Duration::ZERO);
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for(5), Duration::from_secs(32));
    assert_eq!(policy.delay_for(6), Duration::from_secs(60));
    assert_eq!(policy.delay_for(200), Duration::from_secs(60));
  }

  #[test]
  fn test_attempt_ceiling() {
    let policy = RetryPolicy {
      max_attempts: Some(3),
      ..RetryPolicy::immediate()
    };
    assert!(!policy.exhausted(2));
    assert!(policy.exhausted(3));
    assert!(!RetryPolicy::immediate().exhausted(u32::MAX));
  }

  #[test]
  fn test_status_round_trips_through_text() {
    for status in [
      OperationStatus::Pending,
      OperationStatus::Completed,
      OperationStatus::FailedPermanent,
    ] {
      assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
    }
    assert!("done".parse::<OperationStatus>().is_err());
  }
}
