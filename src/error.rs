//! Error types for the offline queue, cache and remote client.

use thiserror::Error;

/// Failure to reach the remote service at all (timeout, refused connection,
/// broken stream). Always retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport error: {message}")]
pub struct TransportError {
  pub message: String,
  pub timed_out: bool,
}

impl TransportError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      timed_out: false,
    }
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      timed_out: true,
    }
  }
}

/// All errors surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
  /// Malformed request, rejected before it reaches the queue.
  #[error("invalid request: {0}")]
  Validation(String),

  /// Local persistence failed. Never swallowed.
  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("storage I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to encode stored value: {0}")]
  Encoding(#[from] serde_json::Error),

  #[error("stored record could not be decoded: {0}")]
  CorruptRecord(String),

  #[error("store lock poisoned")]
  LockPoisoned,

  #[error(transparent)]
  Transport(#[from] TransportError),

  /// 409: the idempotency key was already processed.
  #[error("remote already applied this operation (status {status})")]
  RemoteConflict { status: u16 },

  /// Any other 4xx: a business rejection, not retried.
  #[error("remote rejected request with status {status}: {message}")]
  RemoteRejected { status: u16, message: String },

  /// 5xx: retryable like a transport error.
  #[error("remote server error {status}: {message}")]
  RemoteServerError { status: u16, message: String },

  #[error("a flush is already in progress")]
  FlushInProgress,

  #[error("operation not found: {0}")]
  NotFound(String),
}

impl Error {
  /// Whether replaying the same request later may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Error::Transport(_) | Error::RemoteServerError { .. }
    )
  }
}

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn error_display() {
    let err = Error::Validation("path must start with '/'".into());
    assert_eq!(err.to_string(), "invalid request: path must start with '/'");

    let err = Error::RemoteRejected {
      status: 422,
      message: "insufficient stock".into(),
    };
    assert_eq!(
      err.to_string(),
      "remote rejected request with status 422: insufficient stock"
    );

    let err: Error = TransportError::timeout("deadline elapsed").into();
    assert_eq!(err.to_string(), "transport error: deadline elapsed");
  }

  #[test]
  fn retry_classification() {
    assert!(Error::from(TransportError::new("refused")).is_retryable());
    assert!(Error::RemoteServerError {
      status: 503,
      message: String::new()
    }
    .is_retryable());
    assert!(!Error::RemoteConflict { status: 409 }.is_retryable());
    assert!(!Error::RemoteRejected {
      status: 400,
      message: String::new()
    }
    .is_retryable());
    assert!(!Error::Validation("x".into()).is_retryable());
  }
}
